use std::path::PathBuf;

use jsil_compiler::{compile_file, CompileFlags};

const USAGE: &str = "usage: jsilc <filename.js> [--no-ir] [--no-peephole] [--metrics] [--out FILE]";

struct Options {
    input: PathBuf,
    out: Option<PathBuf>,
    flags: CompileFlags,
}

fn parse_args() -> Result<Options, String> {
    let mut flags = CompileFlags::from_env();
    let mut input = None;
    let mut out = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--no-ir" => flags.ir_pipeline = false,
            "--no-peephole" => flags.peephole = false,
            "--metrics" => flags.collect_metrics = true,
            "--out" => match args.next() {
                Some(path) => out = Some(PathBuf::from(path)),
                None => return Err("--out requires a file name".to_string()),
            },
            other if other.starts_with("--") => return Err(format!("unknown option: {}", other)),
            other => {
                if input.is_some() {
                    return Err("only one input file is supported".to_string());
                }
                input = Some(PathBuf::from(other));
            }
        }
    }

    let input = input.ok_or_else(|| "missing input file".to_string())?;
    Ok(Options { input, out, flags })
}

fn main() {
    let options = match parse_args() {
        Ok(options) => options,
        Err(msg) => {
            eprintln!("{}", msg);
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    };

    let filename = options.input.to_string_lossy().into_owned();
    let content = match std::fs::read_to_string(&options.input) {
        Ok(content) => content,
        Err(err) => {
            eprintln!("error while reading {}: {}", filename, err);
            std::process::exit(1);
        }
    };

    let compiled = match compile_file(&filename, content, options.flags) {
        Ok(compiled) => compiled,
        Err(err) => {
            eprintln!("error:");
            eprintln!("{}", err.message());
            eprintln!();
            std::process::exit(1);
        }
    };

    print!("{}", compiled.assembly.dump());

    if let Some(metrics) = &compiled.metrics {
        println!("{}", metrics.to_json().pretty(2));
    }

    if let Some(out) = &options.out {
        let write = compiled
            .assembly
            .to_bytes()
            .map_err(|err| err.message())
            .and_then(|bytes| std::fs::write(out, bytes).map_err(|err| err.to_string()));
        if let Err(msg) = write {
            eprintln!("error while writing {}: {}", out.display(), msg);
            std::process::exit(1);
        }
    }
}
