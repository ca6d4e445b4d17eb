//! Renders `novaspawn(1)` and one page per subcommand into `OUT_DIR`.

use std::env;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::{Command, CommandFactory};
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

fn render_tree(command: &Command, stem: &str, dir: &Path) -> io::Result<()> {
    let mut page = BufWriter::new(File::create(dir.join(format!("{stem}.1")))?);
    Man::new(command.clone()).title(stem).render(&mut page)?;
    page.flush()?;

    for sub in command.get_subcommands().filter(|sub| !sub.is_hide_set()) {
        render_tree(sub, &format!("{stem}-{}", sub.get_name()), dir)?;
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    writeln!(io::stdout(), "cargo:rerun-if-changed=src/cli/mod.rs")?;
    let dir = env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or("OUT_DIR is only set when cargo runs the build script")?;

    let mut command = cli::Cli::command().version(env!("CARGO_PKG_VERSION"));
    command.build();
    render_tree(&command, "novaspawn", &dir)?;
    Ok(())
}
