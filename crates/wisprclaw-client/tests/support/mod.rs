//! Scripted in-process gateway for integration tests.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Maps an agent message to the response bodies sent for it, in order.
/// Each body is merged into `{"type": "res", "id": <request id>}`.
pub type AgentScript = Arc<dyn Fn(&str) -> Vec<Value> + Send + Sync>;

#[derive(Clone)]
pub enum Hello {
    Accept,
    Reject(String),
    WrongType,
    /// Never answer `connect`.
    Silent,
}

#[derive(Clone)]
pub struct GatewayOptions {
    /// `None` sends no challenge at all; `Some(None)` sends one without a nonce.
    pub challenge: Option<Option<String>>,
    pub challenge_delay: Duration,
    pub hello: Hello,
    pub agent: AgentScript,
    /// Hold agent requests until this many arrived on a connection, then
    /// answer them in reverse order with their replies interleaved.
    pub batch: usize,
    /// Close the connection instead of answering when a batch fills up.
    pub close_when_batch_full: bool,
    /// Close the connection on the first N agent requests (counted globally).
    pub drop_agent_requests: usize,
    /// Close every connection right after the WebSocket upgrade.
    pub close_on_accept: bool,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            challenge: Some(Some("abc123".to_string())),
            challenge_delay: Duration::ZERO,
            hello: Hello::Accept,
            agent: Arc::new(|message| {
                vec![
                    json!({"ok": true, "payload": {"status": "accepted"}}),
                    json!({"ok": true, "payload": {"status": "ok", "result": {"payloads": [{"text": format!("echo: {message}")}]}}}),
                ]
            }),
            batch: 1,
            close_when_batch_full: false,
            drop_agent_requests: 0,
            close_on_accept: false,
        }
    }
}

#[derive(Default)]
pub struct Recorded {
    pub connections: AtomicUsize,
    pub agent_requests: AtomicUsize,
    pub connect_params: Mutex<Vec<Value>>,
    pub agent_params: Mutex<Vec<Value>>,
}

pub struct MockGateway {
    pub url: String,
    pub recorded: Arc<Recorded>,
    task: JoinHandle<()>,
}

impl MockGateway {
    pub async fn start(options: GatewayOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recorded = Arc::new(Recorded::default());

        let task = tokio::spawn({
            let recorded = recorded.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(stream, options.clone(), recorded.clone()));
                }
            }
        });

        Self {
            url: format!("http://{addr}"),
            recorded,
            task,
        }
    }

    pub fn connections(&self) -> usize {
        self.recorded.connections.load(Ordering::SeqCst)
    }

    pub fn agent_requests(&self) -> usize {
        self.recorded.agent_requests.load(Ordering::SeqCst)
    }

    pub fn connect_params(&self) -> Vec<Value> {
        self.recorded.connect_params.lock().unwrap().clone()
    }

    pub fn agent_params(&self) -> Vec<Value> {
        self.recorded.agent_params.lock().unwrap().clone()
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, options: GatewayOptions, recorded: Arc<Recorded>) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    recorded.connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut stream) = ws.split();

    if options.close_on_accept {
        let _ = sink.close().await;
        return;
    }

    if let Some(nonce) = &options.challenge {
        tokio::time::sleep(options.challenge_delay).await;
        let payload = match nonce {
            Some(nonce) => json!({"nonce": nonce, "ts": 1}),
            None => json!({"ts": 1}),
        };
        let event = json!({"type": "event", "event": "connect.challenge", "payload": payload});
        if send(&mut sink, event).await.is_err() {
            return;
        }
    }

    let mut batch: Vec<(String, String)> = Vec::new();

    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else { continue };
        let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };
        if frame["type"] != "req" {
            continue;
        }
        let id = frame["id"].as_str().unwrap_or_default().to_string();

        match frame["method"].as_str() {
            Some("connect") => {
                recorded
                    .connect_params
                    .lock()
                    .unwrap()
                    .push(frame["params"].clone());
                let reply = match &options.hello {
                    Hello::Silent => continue,
                    Hello::Accept => json!({"ok": true, "payload": {"type": "hello-ok", "protocol": 3}}),
                    Hello::Reject(message) => json!({"ok": false, "error": {"message": message}}),
                    Hello::WrongType => json!({"ok": true, "payload": {"type": "something-else"}}),
                };
                if send(&mut sink, response(&id, reply)).await.is_err() {
                    return;
                }
            }
            Some("agent") => {
                recorded.agent_params.lock().unwrap().push(frame["params"].clone());
                let seen = recorded.agent_requests.fetch_add(1, Ordering::SeqCst);
                if seen < options.drop_agent_requests {
                    let _ = sink.close().await;
                    return;
                }

                let message = frame["params"]["message"].as_str().unwrap_or_default().to_string();
                batch.push((id, message));
                if batch.len() < options.batch {
                    continue;
                }
                if options.close_when_batch_full {
                    let _ = sink.close().await;
                    return;
                }

                let scripted: Vec<(String, Vec<Value>)> = batch
                    .drain(..)
                    .rev()
                    .map(|(id, message)| {
                        let replies = (options.agent)(&message);
                        (id, replies)
                    })
                    .collect();
                let rounds = scripted.iter().map(|(_, r)| r.len()).max().unwrap_or(0);
                for round in 0..rounds {
                    for (id, replies) in &scripted {
                        if let Some(reply) = replies.get(round) {
                            if send(&mut sink, response(id, reply.clone())).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            Some(method) => {
                let reply = json!({"ok": true, "payload": {"method": method}});
                if send(&mut sink, response(&id, reply)).await.is_err() {
                    return;
                }
            }
            None => {}
        }
    }
}

fn response(id: &str, body: Value) -> Value {
    let mut frame = json!({"type": "res", "id": id});
    if let (Some(frame), Value::Object(body)) = (frame.as_object_mut(), body) {
        frame.extend(body);
    }
    frame
}

async fn send<S>(sink: &mut S, value: Value) -> Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    sink.send(Message::Text(value.to_string().into())).await
}
