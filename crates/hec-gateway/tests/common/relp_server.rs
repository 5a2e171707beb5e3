// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minimal RELP collector for exercising the sender against a real socket

use bytes::Bytes;
use hec_gateway::sender::relp::RelpFrame;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Default)]
struct State {
    received: Vec<String>,
    connections: usize,
    reject_next: usize,
    drop_next: usize,
}

#[derive(Clone)]
pub struct MockRelpServer {
    pub addr: SocketAddr,
    state: Arc<Mutex<State>>,
}

enum Action {
    Reply(&'static str),
    Drop,
}

impl MockRelpServer {
    /// Start a mock collector on a random port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock collector");
        Self::start_on(listener)
    }

    /// Start a mock collector on an already bound listener
    pub fn start_on(listener: TcpListener) -> Self {
        let addr = listener.local_addr().expect("Failed to get local addr");
        let state = Arc::new(Mutex::new(State::default()));
        let accept_state = state.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                accept_state.lock().unwrap().connections += 1;
                tokio::spawn(Self::handle(stream, accept_state.clone()));
            }
        });

        MockRelpServer { addr, state }
    }

    async fn handle(stream: TcpStream, state: Arc<Mutex<State>>) {
        let mut stream = BufReader::new(stream);
        while let Ok(frame) = RelpFrame::read(&mut stream).await {
            let action = match frame.command.as_str() {
                "open" | "close" => Action::Reply("200 OK"),
                "syslog" => {
                    let mut state = state.lock().unwrap();
                    if state.drop_next > 0 {
                        state.drop_next -= 1;
                        Action::Drop
                    } else if state.reject_next > 0 {
                        state.reject_next -= 1;
                        Action::Reply("500 rejected")
                    } else {
                        state
                            .received
                            .push(String::from_utf8_lossy(&frame.data).into_owned());
                        Action::Reply("200 OK")
                    }
                }
                _ => Action::Reply("500 unknown command"),
            };

            match action {
                Action::Drop => return,
                Action::Reply(status) => {
                    let response = RelpFrame::new(frame.txnr, "rsp", Bytes::from_static(status.as_bytes()));
                    if stream.get_mut().write_all(&response.encode()).await.is_err() {
                        return;
                    }
                }
            }
            if frame.command == "close" {
                return;
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Committed syslog payloads in arrival order
    pub fn received(&self) -> Vec<String> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    /// Answer the next `count` syslog frames with an error status
    pub fn reject_next(&self, count: usize) {
        self.state.lock().unwrap().reject_next = count;
    }

    /// Hang up instead of answering the next `count` syslog frames
    pub fn drop_next(&self, count: usize) {
        self.state.lock().unwrap().drop_next = count;
    }
}
