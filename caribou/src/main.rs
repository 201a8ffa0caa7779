use clap::Parser as ClapParser;
use std::{error::Error, fs, path::PathBuf, process};

use bytecode::{Image, assemble, disassemble};
use caribou::{HeapSettings, Machine, MachineCreateInfo};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Image to run, or assembly source with --assemble
    #[arg(help = "The image (or .casm source) to load")]
    file: PathBuf,

    /// Print the constant pool and instructions instead of running
    #[arg(long, help = "Disassemble the image")]
    disassemble: bool,

    /// Assemble FILE and write the image to OUT
    #[arg(long, value_name = "OUT", help = "Assemble FILE into an image at OUT")]
    assemble: Option<PathBuf>,

    #[arg(long, value_name = "BYTES", help = "Size of one semispace in bytes")]
    space_size: Option<usize>,

    #[arg(long, value_name = "N", help = "Operand stack slots per context")]
    stack_size: Option<usize>,

    #[arg(long, help = "Print collector statistics after the run")]
    stats: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(err) = run(&cli) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn Error>> {
    if let Some(out) = &cli.assemble {
        let source = fs::read_to_string(&cli.file)?;
        let image = assemble(&source)?;
        image.save(out)?;
        log::info!(
            "wrote {} ({} constants, {} code bytes)",
            out.display(),
            image.constants.len(),
            image.code.len()
        );
        return Ok(());
    }

    let image = Image::load(&cli.file)?;
    if cli.disassemble {
        print!("{}", disassemble(&image));
        return Ok(());
    }

    let info = create_info(cli);
    info.validate()?;
    let mut machine = Machine::load(&image, &info)?;
    let result = machine.run()?;
    println!("{}", machine.export(result)?);

    if cli.stats {
        let stats = machine.stats();
        eprintln!(
            "gc: {} collections, {} objects ({} bytes) copied, \
             last cycle reclaimed {} objects ({} bytes)",
            stats.collections,
            stats.objects_copied,
            stats.bytes_copied,
            stats.last_reclaimed_objects,
            stats.last_reclaimed_bytes
        );
    }
    Ok(())
}

fn create_info(cli: &Cli) -> MachineCreateInfo {
    let defaults = MachineCreateInfo::default();
    MachineCreateInfo {
        heap: HeapSettings {
            space_size: cli.space_size.unwrap_or(defaults.heap.space_size),
        },
        stack_size: cli.stack_size.unwrap_or(defaults.stack_size),
        ..defaults
    }
}
