/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use http::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{error, info};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::stream::{ClientStat, Flow, FlowTable};

type GenericError = Box<dyn std::error::Error + Send + Sync>;

const NOT_FOUND: &[u8] = b"Not Found";
const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

const INDEX: &str = "kafkaprobe\n\n\
    GET /metrics  prometheus exposition\n\
    GET /client   per-client activity snapshots\n\
    GET /flow     raw flow table (flow mode only)\n";

pub struct ServerState {
    pub registry: Registry,
    pub client_stat: Option<Arc<ClientStat>>,
    pub flow_table: Option<Arc<FlowTable>>,
}

#[derive(Serialize)]
struct FlowResponse {
    #[serde(rename = "Total")]
    total: usize,
    #[serde(rename = "Flows")]
    flows: Vec<Flow>,
}

async fn handler(
    req: Request<Body>,
    state: Arc<ServerState>,
) -> std::result::Result<Response<Body>, GenericError> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => Ok(Response::builder()
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(INDEX.into())
            .unwrap()),
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let mut buf = Vec::new();
            encoder.encode(&state.registry.gather(), &mut buf)?;
            Ok(Response::builder()
                .header(CONTENT_TYPE, encoder.format_type())
                .body(buf.into())
                .unwrap())
        }
        (&Method::GET, "/client") => match &state.client_stat {
            Some(stat) => json_response(&stat.snapshot()),
            None => not_found(),
        },
        (&Method::GET, "/flow") => match &state.flow_table {
            Some(table) => {
                let flows = table.snapshot();
                json_response(&FlowResponse {
                    total: flows.len(),
                    flows,
                })
            }
            None => not_found(),
        },
        _ => not_found(),
    }
}

fn json_response<T: Serialize>(value: &T) -> std::result::Result<Response<Body>, GenericError> {
    let body = serde_json::to_vec(value)?;
    Ok(Response::builder()
        .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
        .body(body.into())
        .unwrap())
}

fn not_found() -> std::result::Result<Response<Body>, GenericError> {
    Ok(Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(NOT_FOUND.into())
        .unwrap())
}

/// Serves the exposition and snapshot endpoints on its own runtime,
/// concurrently with capture and decoding.
pub struct ApiServer {
    running: Arc<AtomicBool>,
    rt: Runtime,
    thread: Mutex<Option<JoinHandle<()>>>,
    state: Arc<ServerState>,
    addr: SocketAddr,
}

impl ApiServer {
    pub fn new(addr: SocketAddr, state: ServerState) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            rt: Runtime::new().unwrap(),
            thread: Mutex::new(None),
            state: Arc::new(state),
            addr,
        }
    }

    /// Binds synchronously so an unusable address fails startup.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::Relaxed) {
            return Ok(());
        }

        let addr = self.addr;
        let builder = self
            .rt
            .block_on(async move { Server::try_bind(&addr) })
            .map_err(|source| Error::Bind {
                addr: addr.to_string(),
                source,
            })?;

        let state = self.state.clone();
        self.thread.lock().unwrap().replace(self.rt.spawn(async move {
            let service = make_service_fn(move |_| {
                let state = state.clone();
                async { Ok::<_, Infallible>(service_fn(move |req| handler(req, state.clone()))) }
            });
            let server = builder.serve(service);

            info!("serving metrics on http://{}", addr);
            if let Err(e) = server.await {
                error!("http server error: {}", e);
            }
        }));

        info!("http server started");
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        if let Some(t) = self.thread.lock().unwrap().take() {
            t.abort();
        }
        info!("http server stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hyper::Client;
    use rand::random;

    use crate::metrics::Storage;

    use super::*;

    fn start_server(state: ServerState) -> (ApiServer, u16) {
        // a fixed port would collide across test runs
        let port = 34000 + random::<u16>() % 2000;
        let server = ApiServer::new(([127, 0, 0, 1], port).into(), state);
        server.start().unwrap();
        (server, port)
    }

    async fn get(port: u16, path: &str) -> (StatusCode, Option<String>, Vec<u8>) {
        let client = Client::new();
        let uri = format!("http://127.0.0.1:{}{}", port, path)
            .parse()
            .unwrap();
        let resp = client.get(uri).await.unwrap();
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_owned());
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        (status, content_type, body.to_vec())
    }

    #[test]
    fn metrics_and_client_endpoints() {
        let registry = Registry::new();
        let storage = Storage::new(&registry, Duration::from_secs(300)).unwrap();
        storage.add_producer_topic_relation("10.0.0.1", "orders");

        let stat = Arc::new(ClientStat::new());
        stat.observe(
            "10.0.0.1:5000",
            "10.0.0.2:9092",
            "app",
            "Produce",
            &["orders".to_owned()],
            64,
        );

        let (server, port) = start_server(ServerState {
            registry,
            client_stat: Some(stat),
            flow_table: None,
        });

        let rt = Runtime::new().unwrap();
        rt.block_on(async move {
            let (status, content_type, body) = get(port, "/metrics").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(content_type.as_deref(), Some("text/plain; version=0.0.4"));
            let text = String::from_utf8(body).unwrap();
            assert!(text.contains("kafkaprobe_producer_topic_relation_info"));

            let (status, content_type, body) = get(port, "/client").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(
                content_type.as_deref(),
                Some("application/json; charset=utf-8")
            );
            let snap: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(snap[0]["ReqType"], "Produce");
            assert_eq!(snap[0]["Topics"][0], "orders");

            // flow mode is off
            let (status, _, _) = get(port, "/flow").await;
            assert_eq!(status, StatusCode::NOT_FOUND);

            let (status, _, _) = get(port, "/nope").await;
            assert_eq!(status, StatusCode::NOT_FOUND);
        });
        server.stop();
    }

    #[test]
    fn flow_endpoint() {
        let table = Arc::new(FlowTable::new());
        table.update("a:1", "b:2", 10, false);

        let (server, port) = start_server(ServerState {
            registry: Registry::new(),
            client_stat: None,
            flow_table: Some(table),
        });

        let rt = Runtime::new().unwrap();
        rt.block_on(async move {
            let (status, _, body) = get(port, "/flow").await;
            assert_eq!(status, StatusCode::OK);
            let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(value["Total"], 1);
            assert_eq!(value["Flows"][0]["PayloadSum"], 10);
        });
        server.stop();
    }

    #[test]
    fn bind_failure_is_fatal() {
        let (server, port) = start_server(ServerState {
            registry: Registry::new(),
            client_stat: None,
            flow_table: None,
        });

        let second = ApiServer::new(
            ([127, 0, 0, 1], port).into(),
            ServerState {
                registry: Registry::new(),
                client_stat: None,
                flow_table: None,
            },
        );
        assert!(matches!(second.start(), Err(Error::Bind { .. })));
        server.stop();
    }
}
