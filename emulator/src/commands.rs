//! REPL command grammar.

use core::fmt;

use winnow::ascii::{dec_uint, space1};
use winnow::combinator::{alt, opt, preceded};
use winnow::error::{ContextError, ParseError};
use winnow::ModalResult;
use winnow::prelude::*;
use winnow::token::take_while;

/// Iterations `run` performs when no count is given.
pub const DEFAULT_RUN_ITERATIONS: u32 = 64;

pub const HELP_TOPICS: &[(&str, &str)] = &[
    (
        "status",
        "status                            - request the controller status record",
    ),
    (
        "queue",
        "queue <shots> <samples> [handle]  - queue a frame of identical pulse shots",
    ),
    (
        "fetch",
        "fetch <adc> <offset> <count>      - read captured bytes back with GetFrame",
    ),
    (
        "run",
        "run [iterations]                  - step the control loop",
    ),
    (
        "fault",
        "fault                             - fail the next transmit configuration",
    ),
    (
        "clear",
        "clear                             - send ClearFault",
    ),
    (
        "events",
        "events                            - dump the telemetry ring",
    ),
    (
        "help",
        "help [topic]                      - show help for a command",
    ),
];

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReplCommand {
    Status,
    Queue {
        shots: u32,
        samples: u32,
        handle: Option<u32>,
    },
    Fetch {
        adc: u32,
        offset: u32,
        count: u32,
    },
    Run {
        iterations: u32,
    },
    Fault,
    Clear,
    Events,
    Help {
        topic: Option<String>,
    },
}

/// Parse failure with the column it occurred at.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyntaxError {
    pub column: usize,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unexpected input at column {}", self.column + 1)
    }
}

impl From<ParseError<&str, ContextError>> for SyntaxError {
    fn from(error: ParseError<&str, ContextError>) -> Self {
        Self {
            column: error.offset(),
        }
    }
}

/// Parses one trimmed REPL line.
///
/// # Errors
///
/// Returns the column of the first token the grammar could not accept.
pub fn parse(line: &str) -> Result<ReplCommand, SyntaxError> {
    command.parse(line.trim()).map_err(SyntaxError::from)
}

fn command(input: &mut &str) -> ModalResult<ReplCommand> {
    alt((
        "status".value(ReplCommand::Status),
        queue,
        fetch,
        run,
        "fault".value(ReplCommand::Fault),
        "clear".value(ReplCommand::Clear),
        "events".value(ReplCommand::Events),
        help,
    ))
    .parse_next(input)
}

fn number(input: &mut &str) -> ModalResult<u32> {
    preceded(space1, dec_uint).parse_next(input)
}

fn queue(input: &mut &str) -> ModalResult<ReplCommand> {
    preceded("queue", (number, number, opt(number)))
        .map(|(shots, samples, handle)| ReplCommand::Queue {
            shots,
            samples,
            handle,
        })
        .parse_next(input)
}

fn fetch(input: &mut &str) -> ModalResult<ReplCommand> {
    preceded("fetch", (number, number, number))
        .map(|(adc, offset, count)| ReplCommand::Fetch { adc, offset, count })
        .parse_next(input)
}

fn run(input: &mut &str) -> ModalResult<ReplCommand> {
    preceded("run", opt(number))
        .map(|iterations| ReplCommand::Run {
            iterations: iterations.unwrap_or(DEFAULT_RUN_ITERATIONS),
        })
        .parse_next(input)
}

fn help(input: &mut &str) -> ModalResult<ReplCommand> {
    preceded(
        "help",
        opt(preceded(
            space1,
            take_while(1.., |c: char| c.is_ascii_alphanumeric()),
        )),
    )
    .map(|topic: Option<&str>| ReplCommand::Help {
        topic: topic.map(str::to_ascii_lowercase),
    })
    .parse_next(input)
}
