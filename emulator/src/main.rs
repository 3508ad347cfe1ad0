mod commands;
mod devices;
mod link;
mod server;
mod session;

use std::env;
use std::io::{self, BufRead, Write};
use std::process;

use acquisition_core::capture::DEFAULT_BASE_ADDRESS;
use session::Session;

const DEFAULT_PORT: u16 = 26000;
const DEFAULT_GROUP_SPACE: u32 = 1 << 20;
const USAGE: &str = "Usage: acquisition-emulator [--listen] [--port <n>] [--group-space <bytes>]";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Options {
    pub listen: bool,
    pub port: u16,
    pub group_space: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            listen: false,
            port: DEFAULT_PORT,
            group_space: DEFAULT_GROUP_SPACE,
        }
    }
}

fn main() -> io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let options = parse_options(env::args().skip(1)).unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("{USAGE}");
        process::exit(2);
    });

    if options.listen {
        return server::serve(options);
    }
    repl(options)
}

fn repl(options: Options) -> io::Result<()> {
    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    let mut session = Session::new(options.group_space)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let mut line = String::new();

    writeln!(
        writer,
        "Acquisition emulator ready (sample memory at 0x{DEFAULT_BASE_ADDRESS:08x}). Type `help` for commands or `exit` to quit."
    )?;

    loop {
        line.clear();
        write!(writer, "> ")?;
        writer.flush()?;

        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            writeln!(writer)?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if should_terminate(trimmed) {
            writeln!(writer, "Session closed.")?;
            break;
        }

        for response in session.handle_command(trimmed) {
            writeln!(writer, "{response}")?;
        }
    }

    Ok(())
}

fn should_terminate(input: &str) -> bool {
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}

fn parse_options(mut args: impl Iterator<Item = String>) -> Result<Options, String> {
    let mut options = Options::default();
    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };
        match flag.as_str() {
            "--listen" => options.listen = true,
            "--port" => {
                let value = inline.or_else(|| args.next()).ok_or("Expected value after --port")?;
                options.port = value
                    .parse()
                    .map_err(|_| format!("Invalid port `{value}`"))?;
            }
            "--group-space" => {
                let value = inline
                    .or_else(|| args.next())
                    .ok_or("Expected value after --group-space")?;
                options.group_space = match value.parse() {
                    Ok(bytes) if bytes > 0 => bytes,
                    _ => return Err(format!("Invalid group space `{value}`")),
                };
            }
            other => return Err(format!("Unknown argument `{other}`")),
        }
    }
    Ok(options)
}
