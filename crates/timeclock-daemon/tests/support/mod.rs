//! Shared test support: an in-memory daemon context and a mock terminal
//! that speaks the binary control protocol over a loopback socket.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use timeclock_daemon::context::AppContext;
use timeclock_daemon::forward::Forwarder;
use timeclock_daemon::storage::Database;
use timeclock_daemon::sweep::SweepCommand;
use timeclock_wire::frames::{self, PREAMBLE_LEN, command};
use timeclock_wire::{AttRecord, FreeSizes, Packet, TemplateFrame, UserRecord};

/// Build a daemon context over an in-memory database. The receiver half of
/// the sweep channel is returned for tests that drive the scheduler.
pub async fn test_context() -> (Arc<AppContext>, mpsc::Receiver<SweepCommand>) {
    let db = Database::open_in_memory().await.unwrap();
    let (sweep_tx, sweep_rx) = mpsc::channel(8);
    let ctx = Arc::new(AppContext::new(
        db,
        Forwarder::disabled(),
        Duration::from_secs(2),
        sweep_tx,
    ));
    (ctx, sweep_rx)
}

/// Terminal-side state the mock serves and mutates.
#[derive(Debug, Clone, Default)]
pub struct MockState {
    pub users: Vec<UserRecord>,
    pub templates: HashMap<(u16, u8), Vec<u8>>,
    pub punches: Vec<AttRecord>,
    pub sizes: FreeSizes,
    pub firmware: String,
}

const SESSION_ID: u16 = 0x5842;

/// A fake terminal listening on a loopback port.
pub struct MockTerminal {
    pub state: Arc<Mutex<MockState>>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl MockTerminal {
    pub async fn start(state: MockState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(state));

        let accept_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let conn_state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = serve_connection(socket, conn_state).await;
                });
            }
        });

        Self { state, addr, handle }
    }

    pub fn address(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn users(&self) -> Vec<UserRecord> {
        self.state.lock().unwrap().users.clone()
    }

    pub fn templates(&self) -> HashMap<(u16, u8), Vec<u8>> {
        self.state.lock().unwrap().templates.clone()
    }
}

impl Drop for MockTerminal {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A loopback port with nothing listening: bind, read the port, drop the
/// listener. Connections to it are refused immediately.
pub async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn read_frame(socket: &mut TcpStream) -> std::io::Result<Packet> {
    let mut preamble = [0u8; PREAMBLE_LEN];
    socket.read_exact(&mut preamble).await?;
    let len = frames::frame_length(&preamble)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut payload = vec![0u8; len];
    socket.read_exact(&mut payload).await?;
    Packet::decode_payload(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

async fn send(socket: &mut TcpStream, packet: Packet) -> std::io::Result<()> {
    socket.write_all(&packet.encode()).await
}

/// Reply with the chunked bulk-transfer sequence the real firmware uses:
/// PREPARE_DATA announcing the size, DATA chunks, then the closing ACK.
async fn send_bulk(socket: &mut TcpStream, reply_id: u16, data: &[u8]) -> std::io::Result<()> {
    if data.is_empty() {
        return send(socket, Packet::new(command::ACK_OK, SESSION_ID, reply_id, vec![])).await;
    }

    #[allow(clippy::cast_possible_truncation)]
    let announce = (data.len() as u32).to_le_bytes().to_vec();
    send(
        socket,
        Packet::new(command::PREPARE_DATA, SESSION_ID, reply_id, announce),
    )
    .await?;

    for chunk in data.chunks(1024) {
        send(
            socket,
            Packet::new(command::DATA, SESSION_ID, reply_id, chunk.to_vec()),
        )
        .await?;
    }

    send(socket, Packet::new(command::ACK_OK, SESSION_ID, reply_id, vec![])).await
}

async fn serve_connection(
    mut socket: TcpStream,
    state: Arc<Mutex<MockState>>,
) -> std::io::Result<()> {
    loop {
        let request = read_frame(&mut socket).await?;
        let reply_id = request.reply_id;

        match request.command {
            command::CONNECT => {
                send(&mut socket, Packet::new(command::ACK_OK, SESSION_ID, reply_id, vec![])).await?;
            }
            command::EXIT => {
                let _ =
                    send(&mut socket, Packet::new(command::ACK_OK, SESSION_ID, reply_id, vec![]))
                        .await;
                return Ok(());
            }
            command::READ_ATTLOG => {
                let data: Vec<u8> = {
                    let state = state.lock().unwrap();
                    state.punches.iter().flat_map(AttRecord::encode).collect()
                };
                send_bulk(&mut socket, reply_id, &data).await?;
            }
            command::READ_USERS if request.body.is_empty() => {
                let data: Vec<u8> = {
                    let state = state.lock().unwrap();
                    state.users.iter().flat_map(UserRecord::encode).collect()
                };
                send_bulk(&mut socket, reply_id, &data).await?;
            }
            command::READ_USERS => {
                let uid = u16::from_le_bytes([request.body[0], request.body[1]]);
                let finger = request.body[2];
                let template = state.lock().unwrap().templates.get(&(uid, finger)).cloned();
                match template {
                    Some(template) => send_bulk(&mut socket, reply_id, &template).await?,
                    None => {
                        send(
                            &mut socket,
                            Packet::new(command::ACK_ERROR, SESSION_ID, reply_id, vec![]),
                        )
                        .await?;
                    }
                }
            }
            command::SET_USER => match UserRecord::decode(&request.body) {
                Ok(user) => {
                    {
                        let mut state = state.lock().unwrap();
                        if let Some(existing) =
                            state.users.iter_mut().find(|u| u.uid == user.uid)
                        {
                            *existing = user;
                        } else {
                            state.users.push(user);
                        }
                    }
                    send(&mut socket, Packet::new(command::ACK_OK, SESSION_ID, reply_id, vec![]))
                        .await?;
                }
                Err(_) => {
                    send(
                        &mut socket,
                        Packet::new(command::ACK_ERROR, SESSION_ID, reply_id, vec![]),
                    )
                    .await?;
                }
            },
            command::SET_TEMPLATE => match TemplateFrame::decode(&request.body) {
                Ok(frame) => {
                    state
                        .lock()
                        .unwrap()
                        .templates
                        .insert((frame.uid, frame.finger), frame.template);
                    send(&mut socket, Packet::new(command::ACK_OK, SESSION_ID, reply_id, vec![]))
                        .await?;
                }
                Err(_) => {
                    send(
                        &mut socket,
                        Packet::new(command::ACK_ERROR, SESSION_ID, reply_id, vec![]),
                    )
                    .await?;
                }
            },
            command::FREE_SIZES => {
                let body = state.lock().unwrap().sizes.encode();
                send(&mut socket, Packet::new(command::ACK_OK, SESSION_ID, reply_id, body)).await?;
            }
            command::GET_VERSION => {
                let body = state.lock().unwrap().firmware.clone().into_bytes();
                send(&mut socket, Packet::new(command::ACK_OK, SESSION_ID, reply_id, body)).await?;
            }
            command::GET_OPTION => {
                let name_end = request
                    .body
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(request.body.len());
                let name = String::from_utf8_lossy(&request.body[..name_end]).to_string();
                let body = format!("{name}=MockPlatform").into_bytes();
                send(&mut socket, Packet::new(command::ACK_OK, SESSION_ID, reply_id, body)).await?;
            }
            _ => {
                send(
                    &mut socket,
                    Packet::new(command::ACK_ERROR, SESSION_ID, reply_id, vec![]),
                )
                .await?;
            }
        }
    }
}

/// Shorthand for building a terminal-side user row.
pub fn mock_user(uid: u16, user_id: &str, name: &str) -> UserRecord {
    UserRecord {
        uid,
        privilege: 0,
        password: String::new(),
        name: name.to_string(),
        card: 0,
        group: 1,
        user_id: user_id.to_string(),
    }
}

/// Shorthand for building a terminal-side buffered punch.
pub fn mock_punch(uid: u16, user_id: &str, timestamp: &str, punch_code: u8) -> AttRecord {
    AttRecord {
        uid,
        user_id: user_id.to_string(),
        verify: 1,
        timestamp: chrono::NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%d %H:%M:%S").unwrap(),
        punch_code,
    }
}
