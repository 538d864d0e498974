//! Mock server node speaking the info protocol

#![allow(dead_code)]

use aerie_client::{Host, PARTITIONS};
use aerie_protocol::info;
use base64::Engine;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A fake node answering info requests from a mutable value table
#[derive(Clone)]
pub struct MockNode {
    pub host: Host,
    values: Arc<Mutex<HashMap<String, String>>>,
    connections: Arc<AtomicUsize>,
}

impl MockNode {
    pub async fn start(values: &[(&str, &str)]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let node = Self {
            host: Host::new("127.0.0.1", port),
            values: Arc::new(Mutex::new(
                values
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )),
            connections: Arc::new(AtomicUsize::new(0)),
        };

        let server = node.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                server.connections.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(server.clone().serve(socket));
            }
        });
        node
    }

    /// A healthy node named `name` that owns every partition of `namespace`
    pub async fn owning_all(name: &str, namespace: &str) -> Self {
        let all: Vec<usize> = (0..PARTITIONS).collect();
        let replicas = replicas(namespace, 1, &[all.as_slice()]);
        Self::start(&[
            ("node", name),
            ("partition-generation", "1"),
            ("features", "pscans;query-show"),
            ("replicas", replicas.as_str()),
        ])
        .await
    }

    pub fn set(&self, name: &str, value: &str) {
        self.values.lock().insert(name.to_string(), value.to_string());
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    async fn serve(self, mut socket: TcpStream) {
        loop {
            let mut header = [0u8; info::HEADER_SIZE];
            if socket.read_exact(&mut header).await.is_err() {
                return;
            }
            let Ok(len) = info::decode_header(&header) else {
                return;
            };
            let mut body = vec![0u8; len];
            if socket.read_exact(&mut body).await.is_err() {
                return;
            }

            let names = info::parse_request(info::body_to_str(&body).unwrap_or_default());
            let pairs: Vec<(String, String)> = {
                let values = self.values.lock();
                names
                    .into_iter()
                    .map(|name| {
                        let value = values.get(&name).cloned().unwrap_or_default();
                        (name, value)
                    })
                    .collect()
            };

            let mut out = BytesMut::new();
            info::encode_response(&pairs, &mut out);
            if socket.write_all(&out).await.is_err() {
                return;
            }
        }
    }
}

/// Base64 bitmap with the bits of `owned` set
pub fn bitmap(owned: &[usize]) -> String {
    let mut bytes = vec![0u8; PARTITIONS / 8];
    for &p in owned {
        bytes[p >> 3] |= 0x80 >> (p & 7);
    }
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// `replicas` value for one namespace, one owned-partition list per replica level
pub fn replicas(namespace: &str, regime: u32, levels: &[&[usize]]) -> String {
    let bitmaps: Vec<String> = levels.iter().map(|owned| bitmap(owned)).collect();
    format!("{}:{},{},{}", namespace, regime, levels.len(), bitmaps.join(","))
}
