//! Command Step Functions
//!
//! These functions advance a [`Command`] over a [`Connection`] as far as the
//! transport allows without blocking, then tell the caller what to wait for.
//! They never await and never touch the event loop, so they can be driven by
//! a real socket or by a scripted transport in tests.
//!
//! ## One Dispatch
//!
//! ```text
//!   dispatch(cmd, conn)
//!     │
//!     ├─ TLS_CONNECT ──── handshake_once ──┐
//!     ├─ AUTH_WRITE ───── write ───────────┤  phase finished:
//!     ├─ AUTH_READ_* ──── read + check ────┤  move on in the same call
//!     ├─ COMMAND_WRITE ── write ───────────┤  (pipelined writes hand off)
//!     └─ COMMAND_READ_* ─ read + parse ────┘
//!     │
//!     ├─ would block ──► watch READ or WRITE ──► Progress::Pending
//!     │   (unless the transport already buffers data to read)
//!     ├─ response parsed ──────────────────────► Progress::Done
//!     └─ error ────────────────────────────────► Progress::Failed
//! ```
//!
//! A completed write starts the read immediately instead of waiting for a
//! readiness event. A TLS session may redirect a write into a read (or the
//! reverse); the redirected interest is what gets watched.

use tokio::io::Interest;
use tokio::time::Instant;
use tracing::trace;

use crate::command::buffer::ReadBuffer;
use crate::command::handler::Command;
use crate::command::state::CommandState;
use crate::connection::{Connection, IoStatus, Transport};
use crate::error::ClientError;
use crate::protocol::{ProtoHeader, AUTH_RESULT_CODE_OFFSET, MSG_HEADER_SIZE, PROTO_HEADER_SIZE};

/// Outcome of a single write or read step.
#[derive(Debug)]
pub enum Step {
    /// Every byte was transferred.
    WriteComplete,
    /// The socket would block on write.
    WriteIncomplete,
    ReadComplete,
    /// The socket would block on read.
    ReadIncomplete,
    /// TLS needs the peer's bytes before it can continue.
    TlsNeedRead,
    /// TLS needs to send records before it can continue.
    TlsNeedWrite,
    Error(ClientError),
}

/// What the loop adapter should do after a dispatch.
#[derive(Debug)]
pub enum Progress {
    /// Waiting for the readiness set the connection now watches.
    Pending,
    /// The response is complete.
    Done,
    Failed(ClientError),
}

/// Internal continuation between phases.
enum Flow {
    Continue,
    Wait(Interest),
    /// A pipelined write completed; the pipeline moves the command to its
    /// reader list.
    Handoff,
    Done,
    Failed(ClientError),
}

impl From<Step> for Flow {
    fn from(step: Step) -> Self {
        match step {
            Step::WriteComplete | Step::ReadComplete => Flow::Continue,
            Step::WriteIncomplete | Step::TlsNeedWrite => Flow::Wait(Interest::WRITABLE),
            Step::ReadIncomplete | Step::TlsNeedRead => Flow::Wait(Interest::READABLE),
            Step::Error(err) => Flow::Failed(err),
        }
    }
}

fn io_error<T: Transport>(conn: &mut Connection<T>, context: &str, err: &std::io::Error) -> ClientError {
    if conn.transport().is_tls() {
        ClientError::tls(format!("{}: {}", context, err))
    } else {
        ClientError::io(context, err)
    }
}

/// Writes `data[*pos..]`, then flushes anything the transport buffered.
pub fn write<T: Transport>(conn: &mut Connection<T>, data: &[u8], pos: &mut usize) -> Step {
    loop {
        let status = if *pos < data.len() {
            conn.transport().write_once(&data[*pos..])
        } else {
            match conn.transport().flush_once() {
                IoStatus::Done(_) => return Step::WriteComplete,
                other => other,
            }
        };

        match status {
            IoStatus::Done(n) => {
                trace!(conn = conn.id(), bytes = n, "Wrote bytes");
                *pos += n;
            }
            IoStatus::NeedWrite => return Step::WriteIncomplete,
            IoStatus::NeedRead => return Step::TlsNeedRead,
            IoStatus::Closed => {
                return Step::Error(ClientError::connection("Connection closed by peer"))
            }
            IoStatus::Failed(e) => return Step::Error(io_error(conn, "Socket write failed", &e)),
        }
    }
}

/// Reads into `buf[*pos..len]` until full or the transport would block.
pub fn read<T: Transport>(
    conn: &mut Connection<T>,
    buf: &mut ReadBuffer,
    pos: &mut usize,
    len: usize,
) -> Step {
    while *pos < len {
        match conn.transport().read_once(buf.slice_mut(*pos, len)) {
            IoStatus::Done(n) => {
                trace!(conn = conn.id(), bytes = n, "Read bytes");
                *pos += n;
            }
            IoStatus::NeedRead => return Step::ReadIncomplete,
            IoStatus::NeedWrite => return Step::TlsNeedWrite,
            IoStatus::Closed => {
                return Step::Error(ClientError::connection("Connection closed by peer"))
            }
            IoStatus::Failed(e) => return Step::Error(io_error(conn, "Socket read failed", &e)),
        }
    }
    Step::ReadComplete
}

/// Reads the command's current `[pos, len)` window, recording activity for
/// the socket timer.
fn read_window<T: Transport>(cmd: &mut Command, conn: &mut Connection<T>) -> Step {
    let before = cmd.pos;
    let len = cmd.len;
    let step = read(conn, &mut cmd.read_buf, &mut cmd.pos, len);
    if cmd.pos > before {
        cmd.on_bytes_read();
    }
    step
}

fn decode_header(cmd: &Command) -> Result<ProtoHeader, ClientError> {
    Ok(ProtoHeader::decode(cmd.read_buf.slice(PROTO_HEADER_SIZE))?)
}

/// Drives the TLS handshake of a new connection.
fn tls_connect<T: Transport>(cmd: &mut Command, conn: &mut Connection<T>) -> Flow {
    match conn.transport().handshake_once() {
        IoStatus::Done(_) => {
            conn.set_secured();
            trace!(command = cmd.id(), conn = conn.id(), "TLS handshake complete");
            if cmd.auth_request.is_some() && !conn.is_authenticated() {
                cmd.start_auth_write();
            } else {
                cmd.start_command_write();
            }
            Flow::Continue
        }
        IoStatus::NeedRead => Flow::Wait(Interest::READABLE),
        IoStatus::NeedWrite => Flow::Wait(Interest::WRITABLE),
        IoStatus::Closed => Flow::Failed(ClientError::tls("TLS connection shutdown")),
        IoStatus::Failed(e) => Flow::Failed(ClientError::tls(format!("TLS connection failed: {}", e))),
    }
}

fn auth_write<T: Transport>(cmd: &mut Command, conn: &mut Connection<T>) -> Flow {
    let Some(auth) = cmd.auth_request.clone() else {
        cmd.start_command_write();
        return Flow::Continue;
    };

    match write(conn, &auth, &mut cmd.pos) {
        Step::WriteComplete => {
            cmd.on_write_complete(Instant::now());
            cmd.start_header_read(CommandState::AuthReadHeader);
            Flow::Continue
        }
        other => other.into(),
    }
}

/// Reads the authentication response and checks its return code.
fn parse_authentication<T: Transport>(cmd: &mut Command, conn: &mut Connection<T>) -> Flow {
    if cmd.state() == CommandState::AuthReadHeader {
        match read_window(cmd, conn) {
            Step::ReadComplete => {}
            other => return other.into(),
        }
        let header = match decode_header(cmd) {
            Ok(header) => header,
            Err(err) => return Flow::Failed(err),
        };
        cmd.pos = 0;
        cmd.len = header.body_len();
        cmd.set_state(CommandState::AuthReadBody);

        if cmd.len > cmd.read_buf.capacity() || cmd.len <= AUTH_RESULT_CODE_OFFSET {
            return Flow::Failed(ClientError::protocol(format!(
                "Authenticate response size is corrupt: {}",
                cmd.len
            )));
        }
    }

    match read_window(cmd, conn) {
        Step::ReadComplete => {}
        other => return other.into(),
    }

    let code = cmd.read_buf.slice(cmd.len)[AUTH_RESULT_CODE_OFFSET];
    if code != 0 {
        return Flow::Failed(ClientError::authentication(code));
    }

    conn.set_authenticated();
    trace!(command = cmd.id(), conn = conn.id(), "Authenticated");
    cmd.start_command_write();
    Flow::Continue
}

fn command_write<T: Transport>(cmd: &mut Command, conn: &mut Connection<T>) -> Flow {
    let request = cmd.request.clone();
    let before = cmd.pos;
    let step = write(conn, &request, &mut cmd.pos);
    if cmd.pos > before {
        cmd.mark_sent();
    }

    match step {
        Step::WriteComplete => {
            cmd.on_write_complete(Instant::now());
            cmd.start_header_read(CommandState::CommandReadHeader);
            if cmd.is_pipelined() {
                Flow::Handoff
            } else {
                Flow::Continue
            }
        }
        other => other.into(),
    }
}

/// Reads response blocks until the handler reports completion.
///
/// The body of the first block is read right after its header. When a
/// further block follows, its header is peeked: an end block is read and
/// parsed at once, any other block is left for the next read event so one
/// long stream cannot starve other connections.
fn command_read<T: Transport>(cmd: &mut Command, conn: &mut Connection<T>) -> Flow {
    let mut peeking = false;

    loop {
        if cmd.state() == CommandState::CommandReadHeader {
            match read_window(cmd, conn) {
                Step::ReadComplete => {}
                other => return other.into(),
            }
            let header = match decode_header(cmd) {
                Ok(header) => header,
                Err(err) => return Flow::Failed(err),
            };
            cmd.pos = 0;
            cmd.len = header.body_len();
            cmd.set_state(CommandState::CommandReadBody);
            cmd.read_buf.reserve(cmd.len);

            if peeking && cmd.len != MSG_HEADER_SIZE {
                return Flow::Wait(Interest::READABLE);
            }
        }

        match read_window(cmd, conn) {
            Step::ReadComplete => {}
            other => return other.into(),
        }

        match cmd.parse_results() {
            Ok(true) => return Flow::Done,
            Ok(false) => {
                trace!(command = cmd.id(), "More blocks follow");
                cmd.start_header_read(CommandState::CommandReadHeader);
                if peeking {
                    // Only one block is peeked per read event.
                    return Flow::Wait(Interest::READABLE);
                }
                peeking = true;
            }
            Err(err) => return Flow::Failed(err),
        }
    }
}

/// Advances `cmd` on `conn` until it completes, fails or must wait.
///
/// On `Pending` the connection's watch state names the readiness the
/// command is waiting for. While the command is in a reading state and the
/// transport still holds buffered data, dispatch keeps going instead of
/// returning, since no readiness event would arrive for that data.
pub fn dispatch<T: Transport>(cmd: &mut Command, conn: &mut Connection<T>) -> Progress {
    loop {
        let flow = match cmd.state() {
            CommandState::TlsConnect => tls_connect(cmd, conn),
            CommandState::AuthWrite => auth_write(cmd, conn),
            CommandState::AuthReadHeader | CommandState::AuthReadBody => {
                parse_authentication(cmd, conn)
            }
            CommandState::CommandWrite => command_write(cmd, conn),
            CommandState::CommandReadHeader | CommandState::CommandReadBody => {
                command_read(cmd, conn)
            }
            CommandState::Done => Flow::Done,
            state @ (CommandState::Queued | CommandState::Connecting) => {
                Flow::Failed(ClientError::client(format!(
                    "Command {} dispatched in state {}",
                    cmd.id(),
                    state
                )))
            }
        };

        match flow {
            Flow::Continue => continue,
            Flow::Wait(interest) => {
                if interest.is_readable()
                    && cmd.state().reads_buffered_data()
                    && conn.transport().has_pending()
                {
                    trace!(command = cmd.id(), "Transport has buffered data, continuing");
                    continue;
                }
                conn.watch(interest);
                return Progress::Pending;
            }
            Flow::Handoff => return Progress::Pending,
            Flow::Done => return Progress::Done,
            Flow::Failed(err) => return Progress::Failed(err),
        }
    }
}
