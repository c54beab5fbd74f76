//! A small line-framing convenience built on top of `ReceiveAsync`.
//!
//! The original read one byte at a time and branched on `'\r'` and `'\n'`
//! with two independent `if` statements rather than a single match on the
//! configured terminator, so a socket configured for `\r\n` framing still
//! took the lone-`\n` branch on the second byte of the sequence and trimmed
//! the line wrong. Matching on [`Terminator`] once per byte makes that
//! fallthrough impossible.

use crate::error::Error;
use crate::net::socket::TcpSocket;
use crate::sync::{submit, Awaitable, Awaiter};

/// The line terminator `receive_line_async` scans for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    Cr,
    Lf,
    CrLf,
}

impl Terminator {
    fn matches(self, accumulated: &[u8]) -> bool {
        match self {
            Terminator::Cr => accumulated.last() == Some(&b'\r'),
            Terminator::Lf => accumulated.last() == Some(&b'\n'),
            Terminator::CrLf => accumulated.ends_with(b"\r\n"),
        }
    }
}

/// Reads bytes from `socket` one at a time until `terminator` is seen,
/// returning everything read so far, terminator included. Runs on a thread
/// pool worker so the calling thread is never blocked; the returned
/// `Awaiter` can be driven the same way as any other asynchronous result in
/// this crate.
pub(crate) fn receive_line_async(socket: &TcpSocket, terminator: Terminator) -> Awaiter<String> {
    let socket = socket.clone();
    let outer: Awaitable<String> = Awaitable::new();
    let awaiter = outer.awaiter();

    submit(Box::new(move || {
        let result = receive_line(&socket, terminator);
        let _ = match result {
            Ok(line) => outer.set_result(line),
            Err(e) => outer.set_error(e),
        };
    }));

    awaiter
}

fn receive_line(socket: &TcpSocket, terminator: Terminator) -> Result<String, Error> {
    let mut accumulated = Vec::new();
    loop {
        let outcome = socket.receive_async(vec![0u8; 1]).get()?;
        if outcome.bytes_transferred == 0 {
            return Err(Error::ConnectionReset);
        }
        accumulated.push(outcome.buffer[0]);
        if terminator.matches(&accumulated) {
            break;
        }
    }
    String::from_utf8(accumulated).map_err(|_| Error::InvalidArgument("line was not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crlf_terminator_does_not_trigger_on_bare_lf() {
        assert!(!Terminator::CrLf.matches(b"a\n"));
        assert!(Terminator::CrLf.matches(b"a\r\n"));
    }

    #[test]
    fn lf_terminator_ignores_preceding_cr() {
        assert!(Terminator::Lf.matches(b"a\r\n"));
    }

    #[test]
    fn cr_terminator_matches_only_on_bare_cr() {
        assert!(Terminator::Cr.matches(b"a\r"));
        assert!(!Terminator::Cr.matches(b"a\n"));
    }
}
