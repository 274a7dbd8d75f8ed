#![forbid(unsafe_code)]

mod args;
mod config;
mod error;
mod exec;
mod fingerprint;
mod fsutil;
mod orchestrate;
mod output;
mod paths;
mod prelude;
mod store;
mod util;
mod wrapper;

#[cfg(test)]
mod test_util;

use clap::Parser;
use std::ffi::OsString;

use crate::config::Config;
use crate::prelude::*;
use crate::store::LocalStore;

/// A transparent compiler cache. `cachet gcc -c foo.c` behaves exactly
/// like `gcc -c foo.c`, just faster the second time around.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Print cache statistics and exit.
    #[arg(short = 's', long)]
    show_stats: bool,

    /// Reset cache statistics and exit.
    #[arg(short = 'z', long)]
    zero_stats: bool,

    /// Remove every cache entry and exit.
    #[arg(short = 'c', long)]
    clear: bool,

    /// The tool to run, followed by its arguments, verbatim.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<OsString>,
}

fn main() {
    let config = Config::from_env();
    output::init(&config);

    let code = match real_main(&config) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{}: {err:#}", env!("CARGO_PKG_NAME"));
            1
        }
    };
    std::process::exit(code);
}

fn real_main(config: &Config) -> Result<i32> {
    // Symlink mode: installed as e.g. `gcc` early on PATH, argv[0] names
    // the tool and everything else passes through untouched.
    let mut argv = std::env::args_os();
    let argv0 = argv.next().unwrap_or_default();
    let invoked_as = paths::file_part(&argv0.to_string_lossy()).to_string();
    let invoked_as = invoked_as
        .strip_suffix(".exe")
        .unwrap_or(&invoked_as)
        .to_string();
    if !invoked_as.is_empty() && invoked_as != env!("CARGO_PKG_NAME") {
        let rest: Vec<OsString> = argv.collect();
        return orchestrate::run(config, &invoked_as, &rest);
    }

    let cli = Cli::parse();
    if cli.show_stats || cli.zero_stats || cli.clear {
        let store = LocalStore::new(&config.cache_dir, config.max_size)?;
        if cli.clear {
            store.clear()?;
        }
        if cli.zero_stats {
            store.zero_stats()?;
        }
        if cli.show_stats {
            let stats = store.stats()?;
            println!("cache directory  {}", config.cache_dir.display());
            println!("hits             {}", stats.hits);
            println!("misses           {}", stats.misses);
            println!("evictions        {}", stats.evictions);
        }
        return Ok(0);
    }

    let (tool, rest) = match cli.command.split_first() {
        Some(split) => split,
        None => bail!("no command given (try --help)"),
    };
    let tool = tool
        .to_str()
        .ok_or_else(|| eyre!("tool name must be valid UTF-8"))?;
    orchestrate::run(config, tool, rest)
}
