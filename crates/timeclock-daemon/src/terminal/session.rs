//! One open control-channel session against one terminal.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use timeclock_wire::frames::{self, PREAMBLE_LEN, command};
use timeclock_wire::{AttRecord, FreeSizes, Packet, TemplateFrame, UserRecord};

use super::error::TerminalError;

/// An explicit session value returned by [`TerminalSession::open`] and
/// threaded through every control-channel call.
///
/// Every operation is a blocking exchange under a bounded timeout: a stuck
/// terminal costs at most one timeout per call, never an unbounded hang.
pub struct TerminalSession {
    stream: TcpStream,
    session_id: u16,
    reply_id: u16,
    timeout: Duration,
}

impl TerminalSession {
    /// Connect and perform the CONNECT handshake. The terminal's ACK
    /// carries the session id every later packet must echo.
    pub async fn open(address: &str, port: u16, timeout: Duration) -> Result<Self, TerminalError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((address, port)))
            .await
            .map_err(|_| TerminalError::Timeout)??;

        let mut session = Self {
            stream,
            session_id: 0,
            reply_id: 0,
            timeout,
        };

        let reply = session.exchange(command::CONNECT, Vec::new()).await?;
        if reply.command != command::ACK_OK {
            return Err(TerminalError::Refused {
                command: command::CONNECT,
                reply: reply.command,
            });
        }
        session.session_id = reply.session_id;
        debug!(session_id = session.session_id, "Control session open");
        Ok(session)
    }

    /// Close the session. The EXIT command is a courtesy to the terminal;
    /// a dead peer must not turn teardown into an error.
    pub async fn close(mut self) {
        let timeout = self.timeout;
        let frame = Packet::new(
            command::EXIT,
            self.session_id,
            self.reply_id.wrapping_add(1),
            Vec::new(),
        )
        .encode();
        let farewell = async {
            self.stream.write_all(&frame).await?;
            self.stream.flush().await
        };
        if tokio::time::timeout(timeout, farewell).await.is_err() {
            trace!("terminal did not acknowledge EXIT in time");
        }
    }

    /// Fetch the terminal's buffered attendance records.
    pub async fn read_attendance(&mut self) -> Result<Vec<AttRecord>, TerminalError> {
        let reply = self.exchange(command::READ_ATTLOG, Vec::new()).await?;
        let data = self.read_bulk(reply, command::READ_ATTLOG).await?;
        Ok(frames::decode_att_batch(&data))
    }

    /// List the users registered on the terminal.
    pub async fn list_users(&mut self) -> Result<Vec<UserRecord>, TerminalError> {
        let reply = self.exchange(command::READ_USERS, Vec::new()).await?;
        let data = self.read_bulk(reply, command::READ_USERS).await?;
        Ok(frames::decode_user_batch(&data))
    }

    /// Read one fingerprint template. `None` when the slot is empty;
    /// probing empty slots is normal, not an error.
    pub async fn get_template(
        &mut self,
        uid: u16,
        finger: u8,
    ) -> Result<Option<Vec<u8>>, TerminalError> {
        let body = frames::template_request(uid, finger).to_vec();
        let reply = self.exchange(command::READ_USERS, body).await?;
        if reply.command == command::ACK_ERROR {
            return Ok(None);
        }
        let data = self.read_bulk(reply, command::READ_USERS).await?;
        Ok(if data.is_empty() { None } else { Some(data) })
    }

    /// Write one user record to the terminal.
    pub async fn set_user(&mut self, user: &UserRecord) -> Result<(), TerminalError> {
        let reply = self
            .exchange(command::SET_USER, user.encode().to_vec())
            .await?;
        Self::expect_ack(command::SET_USER, &reply)
    }

    /// Write one fingerprint template to the terminal.
    pub async fn set_template(&mut self, frame: &TemplateFrame) -> Result<(), TerminalError> {
        let reply = self.exchange(command::SET_TEMPLATE, frame.encode()).await?;
        Self::expect_ack(command::SET_TEMPLATE, &reply)
    }

    /// Read the terminal's registered-record counters.
    pub async fn free_sizes(&mut self) -> Result<FreeSizes, TerminalError> {
        let reply = self.exchange(command::FREE_SIZES, Vec::new()).await?;
        Self::expect_ack(command::FREE_SIZES, &reply)?;
        Ok(FreeSizes::decode(&reply.body)?)
    }

    /// Read the firmware version string.
    pub async fn firmware_version(&mut self) -> Result<String, TerminalError> {
        let reply = self.exchange(command::GET_VERSION, Vec::new()).await?;
        Self::expect_ack(command::GET_VERSION, &reply)?;
        Ok(decode_text(&reply.body))
    }

    /// Read one named device option (`~Platform`, `~DeviceName`, ...).
    pub async fn get_option(&mut self, name: &str) -> Result<String, TerminalError> {
        let mut body = name.as_bytes().to_vec();
        body.push(0);
        let reply = self.exchange(command::GET_OPTION, body).await?;
        Self::expect_ack(command::GET_OPTION, &reply)?;

        let text = decode_text(&reply.body);
        Ok(text
            .split_once('=')
            .map_or(text.clone(), |(_, value)| value.to_string()))
    }

    fn expect_ack(requested: u16, reply: &Packet) -> Result<(), TerminalError> {
        if reply.command == command::ACK_OK {
            Ok(())
        } else {
            Err(TerminalError::Refused {
                command: requested,
                reply: reply.command,
            })
        }
    }

    /// Send one command and read the terminal's reply packet.
    async fn exchange(&mut self, cmd: u16, body: Vec<u8>) -> Result<Packet, TerminalError> {
        self.reply_id = self.reply_id.wrapping_add(1);
        let packet = Packet::new(cmd, self.session_id, self.reply_id, body);

        let timeout = self.timeout;
        let frame = packet.encode();
        tokio::time::timeout(timeout, async {
            self.stream.write_all(&frame).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| TerminalError::Timeout)??;

        self.read_packet().await
    }

    /// Read one framed packet under the session timeout.
    async fn read_packet(&mut self) -> Result<Packet, TerminalError> {
        let timeout = self.timeout;
        let payload = tokio::time::timeout(timeout, async {
            let mut preamble = [0u8; PREAMBLE_LEN];
            self.stream.read_exact(&mut preamble).await?;
            let len = frames::frame_length(&preamble)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            let mut payload = vec![0u8; len];
            self.stream.read_exact(&mut payload).await?;
            Ok::<_, std::io::Error>(payload)
        })
        .await
        .map_err(|_| TerminalError::Timeout)??;

        Ok(Packet::decode_payload(&payload)?)
    }

    /// Assemble a bulk reply. Small replies arrive inline in the ACK;
    /// larger ones as PREPARE_DATA (announcing the size) followed by DATA
    /// chunks and a closing ACK.
    async fn read_bulk(&mut self, first: Packet, requested: u16) -> Result<Vec<u8>, TerminalError> {
        match first.command {
            command::ACK_OK => Ok(first.body),
            command::PREPARE_DATA => {
                let announced = first
                    .body
                    .get(..4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
                    .unwrap_or(0);
                let mut data = Vec::with_capacity(announced);

                loop {
                    let packet = self.read_packet().await?;
                    match packet.command {
                        command::DATA => data.extend_from_slice(&packet.body),
                        command::ACK_OK => break,
                        other => {
                            return Err(TerminalError::Protocol(format!(
                                "unexpected {other} packet inside bulk transfer"
                            )));
                        }
                    }
                }

                if data.len() < announced {
                    debug!(
                        announced,
                        received = data.len(),
                        "terminal sent less bulk data than announced"
                    );
                }
                Ok(data)
            }
            other => Err(TerminalError::Refused {
                command: requested,
                reply: other,
            }),
        }
    }
}

/// Decode a NUL-padded text reply.
fn decode_text(body: &[u8]) -> String {
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    String::from_utf8_lossy(&body[..end]).trim().to_string()
}

/// Run `op` against a freshly opened session, guaranteeing the session is
/// closed on every exit path: success, early return, or error.
pub async fn with_session<T>(
    address: &str,
    port: u16,
    timeout: Duration,
    op: impl AsyncFnOnce(&mut TerminalSession) -> Result<T, TerminalError>,
) -> Result<T, TerminalError> {
    let mut session = TerminalSession::open(address, port, timeout).await?;
    let result = op(&mut session).await;
    session.close().await;
    result
}
