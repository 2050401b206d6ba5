use clap::{ArgGroup, Parser};
use ksplat_lib::common::ZSTD_MAX_COMPRESSION_LVL;
use ksplat_lib::{
    compress, compress_async, convert, decompress, decompress_async, load, CompressionLevel,
    ParseOptions, SplatTree, TreeConfig,
};
use std::cmp::min;
use std::error::Error;
use std::fs;
use std::process;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(
    name = "ksplat",
    version = "1.0",
    author = "Denis Avvakumov",
    about = "Converts PLY splats to ksplat buffers and back, or inspects a buffer"
)]
#[command(group(
    ArgGroup::new("mode").required(true).args(&["encode", "decode", "info"])
))]
struct Cli {
    #[arg(short = 'e', long = "encode", help = "Convert a PLY file into a ksplat buffer.")]
    encode: bool,

    #[arg(short = 'd', long = "decode", help = "Convert a ksplat buffer back into a PLY file.")]
    decode: bool,

    #[arg(long = "info", help = "Print the header and tree statistics of a ksplat buffer.")]
    info: bool,

    #[arg(
        short = 'i',
        long = "input",
        value_name = "INPUT",
        required = true,
        help = "Path to the input file."
    )]
    input: String,

    #[arg(
        short = 'o',
        long = "output",
        value_name = "OUTPUT",
        help = "Path to the output file (required with --encode and --decode)."
    )]
    output: Option<String>,

    #[arg(
        short = 'l',
        long = "level",
        value_name = "LEVEL",
        default_value = "0",
        value_parser = clap::value_parser!(u8).range(0..=1),
        help = "Splat buffer compression level: 0 full precision, 1 half precision."
    )]
    level: u8,

    #[arg(
        short = 'm',
        long = "min-alpha",
        value_name = "ALPHA",
        default_value = "1.0",
        help = "Drop splats whose alpha (0-255) is not above this value."
    )]
    min_alpha: f32,

    #[arg(
        short = 'b',
        long = "bucket-size",
        value_name = "SPLATS",
        default_value = "256",
        help = "Splats per quantization bucket."
    )]
    bucket_size: usize,

    #[arg(
        long = "block-size",
        value_name = "SIZE",
        default_value = "5.0",
        help = "Edge length of a bucket cell."
    )]
    block_size: f32,

    #[arg(
        short = 'z',
        long = "zstd",
        default_value = "false",
        help = "Wrap the encoded buffer in a zstd frame."
    )]
    zstd: bool,

    #[arg(
        short = 'c',
        long = "compression-level",
        value_name = "LEVEL",
        default_value = "3",
        help = "Set the zstd compression level."
    )]
    compression_level: u32,

    #[arg(
        short = 'w',
        long = "workers",
        value_name = "WORKERS",
        default_value = "3",
        help = "Set the workers count for ZSTD."
    )]
    workers: u32,

    #[arg(
        short = 'a',
        long = "async",
        default_value = "false",
        help = "Enable asynchronous compression/decompression mode."
    )]
    async_mode: bool,
}

type BoxError = Box<dyn Error + Send + Sync>;

fn print_info(raw_data: &[u8]) -> Result<(), BoxError> {
    let buffer = load(raw_data)?;
    println!("Compression level: {:?}", buffer.compression_level());
    println!("Splat count: {}", buffer.splat_count());
    if buffer.compression_level().uses_buckets() {
        println!(
            "Buckets: {} x {} splats, block size {}",
            buffer.bucket_count(),
            buffer.bucket_size(),
            buffer.bucket_block_size()
        );
    }
    println!(
        "Buffer size: {} bytes ({} bytes of splat data)",
        buffer.as_bytes().len(),
        buffer.data_len()
    );

    let tree = SplatTree::build_visible(&TreeConfig::default(), &buffer, 0);
    let stats = tree.stats();
    println!(
        "Tree: {} nodes, {} leaves, {} with splats, max depth {}",
        stats.node_count, stats.leaf_count, stats.populated_leaf_count, stats.max_leaf_depth
    );
    println!(
        "Splats per populated leaf: avg {:.1}, max {}",
        stats.average_splats_per_leaf, stats.max_splats_per_leaf
    );
    Ok(())
}

fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let raw_data = fs::read(&cli.input).unwrap_or_else(|e| {
        eprintln!("Error reading input file {}: {}", cli.input, e);
        process::exit(1);
    });

    if cli.info {
        return print_info(&raw_data);
    }

    let output = cli.output.clone().unwrap_or_else(|| {
        eprintln!("Error: --output (-o) is required with --encode and --decode.");
        process::exit(1);
    });
    if cli.zstd && !cli.encode {
        eprintln!("Error: --zstd (-z) can only be used with encoding (-e).");
        process::exit(1);
    }

    let options = ParseOptions {
        compression_level: CompressionLevel::try_from(cli.level)?,
        minimum_alpha: cli.min_alpha,
        bucket_size: cli.bucket_size,
        block_size: cli.block_size,
    };

    let mode = if cli.async_mode {
        "Asynchronous"
    } else {
        "Synchronous"
    };
    let op = if cli.decode { "Decoding" } else { "Encoding" };

    print!("Mode: {} {}\nInput: {} | Output: {}", mode, op, cli.input, output);
    if cli.encode {
        print!(" | Level: {:?}", options.compression_level);
        if cli.zstd {
            print!(" | zstd level: {}", cli.compression_level);
        }
    }
    println!();

    let cmp_level = min(cli.compression_level, ZSTD_MAX_COMPRESSION_LVL);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let start = Instant::now();

    let result: Vec<u8> = if cli.async_mode {
        rt.block_on(async {
            let mut buf = Vec::new();
            if cli.encode && cli.zstd {
                compress_async(&raw_data, &options, cmp_level, cli.workers, &mut buf).await?;
            } else if cli.encode {
                convert(&raw_data, &options, &mut buf)?;
            } else {
                decompress_async(&raw_data, &mut buf).await?;
            }
            Ok::<Vec<u8>, BoxError>(buf)
        })?
    } else {
        let mut buf = Vec::new();
        if cli.encode && cli.zstd {
            compress(&raw_data, &options, cmp_level, cli.workers, &mut buf)?;
        } else if cli.encode {
            convert(&raw_data, &options, &mut buf)?;
        } else {
            decompress(&raw_data, &mut buf)?;
        }
        buf
    };

    let elapsed = start.elapsed().as_millis();
    println!("{} Time: {} ms", op, elapsed);

    fs::write(&output, &result).unwrap_or_else(|e| {
        eprintln!("Error writing output '{}': {}", output, e);
        process::exit(1);
    });
    println!("Successfully wrote to '{}'.", output);

    Ok(())
}
