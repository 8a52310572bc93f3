// SPDX-License-Identifier: MIT
//
// gscdec
//
// Parse compiled GSC script objects, disassemble the code segment and
// reconstruct high-level source where the control flow allows it.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use gscdec::emit::formatter_of;
use gscdec::flow::StepSkip;
use gscdec::hash::HashIndex;
use gscdec::process::{process_file, Options, RunState};
use gscdec::rosetta::RosettaSink;
use gscdec::vm::{platform_of, vm_of};

const EXTENSIONS: &[&str] = &["gscc", "cscc", "gscbin", "cscbin", "gsic", "csic"];

#[derive(Parser)]
#[command(
    name = "gscdec",
    version,
    about = "GSC compiled script parser, disassembler and decompiler"
)]
struct Cli {
    /// Input script files or directories.
    inputs: Vec<PathBuf>,

    /// Produce reconstructed GSC source (default when --asm is not given).
    #[arg(short = 'g', long)]
    gsc: bool,

    /// Produce disassembly listings.
    #[arg(short = 'a', long)]
    asm: bool,

    /// Write the file header banner.
    #[arg(short = 'H', long)]
    header: bool,

    /// Write the relative location of the function code.
    #[arg(short = 'l', long)]
    rloc: bool,

    /// Target platform: pc, ps, xbox.
    #[arg(short = 't', long = "type", default_value = "pc")]
    platform: String,

    /// VM revision, required for wide-hash (IW) script files.
    #[arg(short = 'v', long)]
    vm: Option<String>,

    /// Output formatter.
    #[arg(short = 'f', long, default_value = "default")]
    format: String,

    /// Skip reconstruction steps: d/D/s/e/w/i/f/r/R/c/S, a for all.
    #[arg(short = 'i', long)]
    ignore: Option<String>,

    /// Output directory, default next to the input with an `asm` suffix.
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Write the extracted-hash log into a file.
    #[arg(short = 'm', long)]
    hashmap: Option<PathBuf>,

    /// Dump every decrypted string literal into a file.
    #[arg(long)]
    dumpstrings: Option<PathBuf>,

    /// Create a rosetta opcode index.
    #[arg(short = 'r', long)]
    rosetta: Option<PathBuf>,

    /// Comment text put in front of every output file.
    #[arg(short = 'C', long)]
    copyright: Option<String>,

    /// Write the imports table.
    #[arg(short = 'I', long)]
    imports: bool,

    /// Write the strings table.
    #[arg(short = 'S', long)]
    strings: bool,

    /// Write the global variables table.
    #[arg(short = 'G', long)]
    gvars: bool,

    /// Do not write `#using` lines.
    #[arg(short = 'U', long)]
    noincludes: bool,

    /// Do not write per-function header comments.
    #[arg(short = 'F', long)]
    nofuncheader: bool,

    /// Print the unknown header fields.
    #[arg(long)]
    test_header: bool,

    /// Skip link patching.
    #[arg(short = 'P', long)]
    nopatch: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    // bad option values exit with the usage code, like a parse failure
    let vm = match &cli.vm {
        Some(name) => match vm_of(name) {
            Some(info) => Some(info.vm),
            None => {
                error!("unknown vm: {}", name);
                return ExitCode::from(2);
            }
        },
        None => None,
    };
    let platform = match platform_of(&cli.platform) {
        Ok(platform) => platform,
        Err(err) => {
            error!("{:#}", err);
            return ExitCode::from(2);
        }
    };
    let formatter = formatter_of(&cli.format);
    if !formatter.name.eq_ignore_ascii_case(&cli.format) {
        error!("unknown formatter: {}, use {}", cli.format, formatter.name);
        return ExitCode::from(2);
    }
    let skip = match cli.ignore.as_deref().map(StepSkip::from_letters) {
        Some(Ok(skip)) => skip,
        Some(Err(letter)) => {
            error!("bad --ignore letter: '{}'", letter);
            return ExitCode::from(2);
        }
        None => StepSkip::empty(),
    };

    let opts = Options {
        vm,
        platform,
        formatter,
        skip,
        output_dir: cli.output.clone(),
        copyright: cli.copyright.clone(),
        header: cli.header,
        dasm: cli.asm,
        dcomp: cli.gsc || !cli.asm,
        includes: !cli.noincludes,
        imports: cli.imports,
        strings: cli.strings,
        gvars: cli.gvars,
        func_header: !cli.nofuncheader,
        func_rloc: cli.rloc,
        test_header: cli.test_header,
        patch: !cli.nopatch,
    };

    let hash = HashIndex::new(cli.hashmap.is_some());
    hash.load_default();
    let mut state = RunState {
        hash,
        registry: gscdec::default_registry(),
        rosetta: RosettaSink::new(cli.rosetta.is_some()),
        dumped_strings: Default::default(),
    };

    let mut inputs = cli.inputs.clone();
    if inputs.is_empty() {
        inputs.push(PathBuf::from("scriptparsetree"));
    }

    let mut ret = 0u8;
    for input in &inputs {
        let code = handle_path(input, &opts, &mut state);
        if ret == 0 {
            ret = code;
        }
    }

    if let Some(path) = &cli.dumpstrings {
        let text: String = state
            .dumped_strings
            .iter()
            .map(|s| format!("{}\n", s))
            .collect();
        if let Err(err) = fs::write(path, text) {
            error!("can't open string output {}: {}", path.display(), err);
            if ret == 0 {
                ret = 1;
            }
        }
    }
    if let Some(path) = &cli.rosetta {
        match fs::File::create(path) {
            Ok(mut file) => {
                if let Err(err) = state.rosetta.write(&mut file) {
                    error!("can't write rosetta output: {:#}", err);
                    if ret == 0 {
                        ret = 1;
                    }
                } else {
                    info!("rosetta index created into '{}'", path.display());
                }
            }
            Err(err) => {
                error!("can't open rosetta output {}: {}", path.display(), err);
                if ret == 0 {
                    ret = 1;
                }
            }
        }
    }
    if let Some(path) = &cli.hashmap {
        if let Err(err) = state.hash.write_extracted(path) {
            error!("can't write hashmap: {:#}", err);
            if ret == 0 {
                ret = 1;
            }
        }
    }

    info!("done.");
    ExitCode::from(ret)
}

/// Recurse directories, filter on the script extensions, process files. The
/// first failing file sets the run's return code; later files still run.
fn handle_path(path: &Path, opts: &Options, state: &mut RunState) -> u8 {
    if path.is_dir() {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(err) => {
                error!("can't read directory {}: {}", path.display(), err);
                return 1;
            }
        };
        let mut ret = 0u8;
        for entry in entries.flatten() {
            let code = handle_path(&entry.path(), opts, state);
            if ret == 0 {
                ret = code;
            }
        }
        return ret;
    }

    let matches_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false);
    if !matches_ext {
        return 0;
    }

    match process_file(path, opts, state) {
        Ok(_) => 0,
        Err(err) => {
            error!("{}: {:#}", path.display(), err);
            1
        }
    }
}
