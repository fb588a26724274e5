use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;

use wasm_x64::{CompileOptions, CompiledFunction};

#[derive(Parser)]
#[command(name = "wasm-x64")]
#[command(about = "WASM to x86-64 baseline JIT compiler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a module and list the generated code and relocations.
    Compile {
        #[arg(help = "Input WASM or WAT file")]
        input: PathBuf,

        #[arg(
            short,
            long,
            help = "Write the raw code bytes of all functions, concatenated"
        )]
        output: Option<PathBuf>,

        #[arg(long, help = "Emit an int3 breakpoint on every function entry")]
        debug_break: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Compile {
            input,
            output,
            debug_break,
        } => {
            let wasm = read_wasm(&input)?;
            let options = CompileOptions {
                debug_break_on_entry: debug_break,
            };
            let module = wasm_x64::compile_with_options(&wasm, &options)
                .context("Compilation failed")?;

            for (i, function) in module.functions.iter().enumerate() {
                print_function(i, function);
            }

            if let Some(path) = output {
                let mut bytes = Vec::new();
                for function in &module.functions {
                    bytes.extend_from_slice(&function.code);
                }
                fs::write(&path, &bytes)
                    .with_context(|| format!("Failed to write output to {}", path.display()))?;
                println!(
                    "Wrote {} bytes across {} functions to {}",
                    bytes.len(),
                    module.functions.len(),
                    path.display()
                );
            }
        }
    }

    Ok(())
}

fn read_wasm(path: &PathBuf) -> Result<Vec<u8>> {
    let contents = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

    if path.extension().is_some_and(|e| e == "wat") {
        wat::parse_bytes(&contents)
            .map(std::borrow::Cow::into_owned)
            .map_err(|e| anyhow::anyhow!("WAT parse error: {e}"))
    } else {
        Ok(contents)
    }
}

fn print_function(index: usize, function: &CompiledFunction) {
    println!(
        "func[{index}]: {} bytes, {} relocations",
        function.code.len(),
        function.relocs.len()
    );
    for (i, chunk) in function.code.chunks(16).enumerate() {
        print!("  {:06x}:", i * 16);
        for byte in chunk {
            print!(" {byte:02x}");
        }
        println!();
    }
    for reloc in &function.relocs {
        println!(
            "  reloc {:?} at {:#06x} (index {})",
            reloc.kind, reloc.code_offset, reloc.index
        );
    }
}
