use std::{
    io::{self, Write},
    path::PathBuf,
};

use clap::{Arg, ArgAction, Command};
use logtrack::{TailerBuilder, TailerConfig};

fn main() -> Result<(), anyhow::Error> {
    let app = Command::new("persistent_tail")
        .arg(
            Arg::new("FILE_PATH")
                .required(true)
                .help("path to log file that is possibly rotated"),
        )
        .arg(
            Arg::new("OFFSET_FILE")
                .long("offset-file")
                .short('o')
                .help("file used to keep track of read position, defaults to <FILE_PATH>.offset"),
        )
        .arg(
            Arg::new("PARANOID")
                .long("paranoid")
                .short('p')
                .action(ArgAction::SetTrue)
                .help("update offset file after every line"),
        )
        .arg(
            Arg::new("FULL_LINES")
                .long("full-lines")
                .action(ArgAction::SetTrue)
                .help("only print lines terminated by a newline"),
        );

    let args = app.get_matches();

    let config = TailerConfig {
        offset_file: args.get_one::<String>("OFFSET_FILE").map(PathBuf::from),
        paranoid: args.get_flag("PARANOID"),
        full_lines: args.get_flag("FULL_LINES"),
        ..Default::default()
    };
    let path = args
        .get_one::<String>("FILE_PATH")
        .ok_or_else(|| anyhow::anyhow!("missing log path"))?;

    // stdout must reach its destination before position moves past the printed lines
    let mut tailer = TailerBuilder::new(path)
        .config(config)
        .on_update(|| io::stdout().flush())
        .on_warning(|warning| eprintln!("[logtrack] [WARN] {warning}"))
        .open()?;

    let mut stdout = io::stdout().lock();
    while let Some(line) = tailer.next_line()? {
        stdout.write_all(line.as_bytes())?;
    }
    drop(stdout);
    tailer.close()?;

    Ok(())
}
