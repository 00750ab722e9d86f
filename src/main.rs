//! The `fsmap` command scans a raw ext2/3/4 or NTFS volume image and writes
//! every allocated file's physical extents and metadata as CSV lines.

use fsmap::device::image_sectors;
use fsmap::device::ImageFile;
use fsmap::error;
use fsmap::probe::probe;
use fsmap::sink::Extent;
use fsmap::sink::Metadata;
use log::info;
use std::env::ArgsOs;
use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::exit;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// If true, print command line help.
    help: bool,
    /// The path the extent lines are written to.
    output: Option<PathBuf>,
    /// The path the metadata lines are written to.
    meta_output: Option<PathBuf>,
    /// The path to the volume image.
    image: Option<PathBuf>,
}

fn parse_args(bin: &str, args: ArgsOs) -> Args {
    let mut res: Args = Default::default();
    let mut iter = args;
    while let Some(arg) = iter.next() {
        match arg.to_str() {
            Some("-h" | "--help") => res.help = true,
            Some("-o" | "--output") => {
                res.output = Some(iter.next().map(PathBuf::from).unwrap_or_else(|| {
                    error(bin, "-o requires a path");
                }));
            }
            Some("-m" | "--metadata-output") => {
                res.meta_output = Some(iter.next().map(PathBuf::from).unwrap_or_else(|| {
                    error(bin, "-m requires a path");
                }));
            }
            _ => {
                if res.image.is_some() {
                    error(bin, "several images specified");
                }
                res.image = Some(arg.into());
            }
        }
    }
    res
}

/// Prints the command's usage.
fn print_usage(bin: &str) {
    eprintln!("Usage:");
    eprintln!(" {bin} [-h] [-o <file>] [-m <file>] <image>");
    eprintln!();
    eprintln!("Scans the ext2/3/4 or NTFS volume image and writes one line per");
    eprintln!("contiguous file extent and one line per file's metadata.");
    eprintln!();
    eprintln!("Options:");
    eprintln!(" -h, --help:\t\t\tprints usage");
    eprintln!(" -o, --output <file>:\t\tthe extents file (default: out.txt)");
    eprintln!(" -m, --metadata-output <file>:\tthe metadata file (default: meta_out.txt)");
    eprintln!(" image:\t\t\t\tthe path to the volume image or block device");
}

fn create_output(bin: &str, path: &Path) -> BufWriter<File> {
    let file = File::create(path).unwrap_or_else(|e| {
        error(bin, format!("{}: {e}", path.display()));
    });
    BufWriter::new(file)
}

fn main() {
    env_logger::init();

    let (bin, args) = fsmap::args();
    let args = parse_args(&bin, args);
    if args.help {
        print_usage(&bin);
        exit(0);
    }
    let image_path = args.image.unwrap_or_else(|| {
        print_usage(&bin);
        error(&bin, "specify the path to a volume image");
    });

    let sectors = image_sectors(&image_path).unwrap_or_else(|e| {
        error(&bin, format!("{}: {e}", image_path.display()));
    });
    if sectors == 0 {
        error(&bin, format!("{}: empty image", image_path.display()));
    }
    info!("scanning {} ({sectors} sectors)", image_path.display());

    let disk = ImageFile::open(&image_path).unwrap_or_else(|e| {
        error(&bin, format!("{}: {e}", image_path.display()));
    });

    let output_path = args.output.unwrap_or_else(|| PathBuf::from("out.txt"));
    let meta_path = args.meta_output.unwrap_or_else(|| PathBuf::from("meta_out.txt"));
    let mut output = create_output(&bin, &output_path);
    let mut meta_output = create_output(&bin, &meta_path);

    let walker = probe(disk).unwrap_or_else(|e| {
        error(&bin, e);
    });

    walker
        .parse(
            &mut |e: &Extent| {
                writeln!(
                    output,
                    "{},{},{},{},{}",
                    e.file, e.file_size, e.start_offset, e.start_phys_offset, e.length
                )
                .unwrap_or_else(|e| {
                    error(&bin, format!("{}: {e}", output_path.display()));
                });
            },
            &mut |m: &Metadata| {
                writeln!(
                    meta_output,
                    "{},{},{},{},{},{},{}",
                    m.inode,
                    m.file_size,
                    m.compressed as u8,
                    m.encrypted as u8,
                    m.ctime,
                    m.mtime,
                    m.atime
                )
                .unwrap_or_else(|e| {
                    error(&bin, format!("{}: {e}", meta_path.display()));
                });
            },
        )
        .unwrap_or_else(|e| {
            error(&bin, e);
        });

    for (mut writer, path) in [(output, output_path), (meta_output, meta_path)] {
        writer.flush().unwrap_or_else(|e| {
            error(&bin, format!("{}: {e}", path.display()));
        });
    }
}
