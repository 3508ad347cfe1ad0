//! TCP front door for the emulated controller.

use std::io::{self, ErrorKind};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use acquisition_core::ControllerConfig;
use log::{info, warn};

use crate::Options;
use crate::link::TcpLink;
use crate::session::build_controller;

const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Serves the wire protocol until the listener fails.
///
/// One client is served at a time; a new connection replaces the old one.
///
/// # Errors
///
/// Returns the error that stopped the listener.
pub fn serve(options: Options) -> io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", options.port))?;
    listener.set_nonblocking(true)?;
    info!("server: listening on {}", listener.local_addr()?);

    let mut controller = build_controller(options.group_space)
        .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err.to_string()))?;
    let mut link = TcpLink::new(ControllerConfig::default().protocol.fragment_len());

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!("server: client {peer} connected");
                link.attach(stream)?;
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => return Err(err),
        }

        match controller.poll(&mut link) {
            Ok(Some(transition)) => info!(
                "server: {} -> {} on {}",
                transition.from, transition.to, transition.event
            ),
            Ok(None) => {}
            Err(err) => {
                warn!("server: dropping client: {err}");
                link.detach();
            }
        }

        if !link.is_connected() {
            thread::sleep(IDLE_SLEEP);
        }
    }
}
