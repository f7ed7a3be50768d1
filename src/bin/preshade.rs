use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, Write as _},
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use clap::Parser;

use preshade::{FsFileCallback, Preprocessor};

#[derive(Parser, Debug)]
#[command(name = "preshade", version, about = "Shader-source preprocessor")]
struct Cli {
    /// Input shader source.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Output path; stdout when omitted.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Macro definition, NAME=VALUE. Repeatable.
    #[arg(short = 'D', long = "define", value_name = "NAME=VALUE")]
    defines: Vec<String>,

    /// JSON file with a string-to-string map of macro definitions.
    #[arg(long, value_name = "FILE")]
    defines_json: Option<PathBuf>,

    /// Directory `#include` targets are resolved against; defaults to the
    /// input file's directory.
    #[arg(long, value_name = "DIR")]
    include_root: Option<PathBuf>,

    /// Emit surviving lines with their source line numbers as JSON instead of
    /// flattened text.
    #[arg(long)]
    dump_lines: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let include_root = cli
        .include_root
        .clone()
        .or_else(|| cli.in_path.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));

    let mut pp =
        Preprocessor::with_file_callback(Box::new(FsFileCallback::with_root(&include_root)));
    seed_defines(&mut pp, &cli)?;

    let source = std::fs::read_to_string(&cli.in_path)
        .with_context(|| format!("read '{}'", cli.in_path.display()))?;

    let rendered = if cli.dump_lines {
        let lines = pp.process_lines(&source).map_err(anyhow::Error::new)?;
        serde_json::to_string_pretty(&lines).with_context(|| "serialize lines")?
    } else {
        let mut out = String::new();
        if !pp.process(&source, &mut out) {
            match pp.last_error() {
                Some(e) => anyhow::bail!("{}", e),
                None => anyhow::bail!("preprocessing failed"),
            }
        }
        out
    };

    match &cli.out {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create output dir '{}'", parent.display()))?;
            }
            std::fs::write(path, rendered)
                .with_context(|| format!("write '{}'", path.display()))?;
            eprintln!("wrote {}", path.display());
        }
        None => {
            std::io::stdout()
                .write_all(rendered.as_bytes())
                .with_context(|| "write stdout")?;
        }
    }

    Ok(())
}

fn seed_defines(pp: &mut Preprocessor, cli: &Cli) -> anyhow::Result<()> {
    if let Some(path) = &cli.defines_json {
        let f = File::open(path).with_context(|| format!("open defines '{}'", path.display()))?;
        let map: BTreeMap<String, String> =
            serde_json::from_reader(BufReader::new(f)).with_context(|| "parse defines JSON")?;
        for (name, value) in &map {
            if !pp.add_define(name, value) {
                anyhow::bail!("bad define '{name}': {}", last_error_text(pp));
            }
        }
    }

    for spec in &cli.defines {
        let (name, value) = spec
            .split_once('=')
            .with_context(|| format!("define '{spec}' is not NAME=VALUE"))?;
        if !pp.add_define(name, value) {
            anyhow::bail!("bad define '{name}': {}", last_error_text(pp));
        }
    }

    Ok(())
}

fn last_error_text(pp: &Preprocessor) -> String {
    pp.last_error()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown error".to_string())
}
