//! Shared loopback-host harness for integration tests.
//!
//! Starts an HTTP server on an ephemeral port, routes every request
//! through a swappable handler, and records each request (method, path,
//! body) so tests can assert on wire traffic — page counts, endpoints
//! never hit, refresh exchanges.

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{Request, Response, body::Incoming, service::service_fn};
use hyper_util::{rt::TokioExecutor, server::conn::auto};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

/// One request as seen by the mock host.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path_and_query: String,
    pub authorization: Option<String>,
    pub body: String,
}

impl RecordedRequest {
    /// True when this request hit `path` (ignoring the query string).
    pub fn is_path(&self, path: &str) -> bool {
        self.path_and_query
            .split('?')
            .next()
            .is_some_and(|p| p == path)
    }

    /// Value of one query parameter, when present.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.path_and_query.split_once('?')?.1;
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == name).then(|| value.to_owned())
        })
    }
}

/// Handler invoked for each incoming request.
pub type Handler = Arc<Mutex<Box<dyn FnMut(&RecordedRequest) -> Response<Full<Bytes>> + Send>>>;

/// Running mock host plus its recorded traffic.
pub struct MockHost {
    pub addr: SocketAddr,
    pub handler: Handler,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
    join: JoinHandle<()>,
    stop: oneshot::Sender<()>,
}

impl MockHost {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Swap the request handler.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: FnMut(&RecordedRequest) -> Response<Full<Bytes>> + Send + 'static,
    {
        *self.handler.lock().expect("lock handler") = Box::new(handler);
    }

    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("lock requests").clone()
    }

    /// Count of requests whose path (sans query) equals `path`.
    pub fn hits(&self, path: &str) -> usize {
        self.recorded().iter().filter(|r| r.is_path(path)).count()
    }

    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        let _ = self.join.await;
    }
}

/// Build a JSON response with the given status.
pub fn json_response(status: u16, body: &serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::from(body.to_string()))
        .expect("build response")
}

/// Start the mock host; the default handler answers 404 to everything.
pub async fn start_host() -> Result<MockHost, std::io::Error> {
    let handler: Handler = Arc::new(Mutex::new(Box::new(|_req| {
        Response::builder()
            .status(404)
            .body(Full::from("no handler installed"))
            .expect("build default response")
    })));
    let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (stop, mut stop_rx) = oneshot::channel();

    let handler_for_server = handler.clone();
    let requests_for_server = requests.clone();
    let join = tokio::spawn(async move {
        let builder = auto::Builder::new(TokioExecutor::new());
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let io = hyper_util::rt::TokioIo::new(stream);
                        let handler = handler_for_server.clone();
                        let requests = requests_for_server.clone();
                        let service = service_fn(move |req: Request<Incoming>| {
                            let handler = handler.clone();
                            let requests = requests.clone();
                            async move {
                                let (parts, body) = req.into_parts();
                                let bytes = body
                                    .collect()
                                    .await
                                    .map(|b| b.to_bytes())
                                    .unwrap_or_default();
                                let recorded = RecordedRequest {
                                    method: parts.method.to_string(),
                                    path_and_query: parts
                                        .uri
                                        .path_and_query()
                                        .map(ToString::to_string)
                                        .unwrap_or_default(),
                                    authorization: parts
                                        .headers
                                        .get(hyper::header::AUTHORIZATION)
                                        .and_then(|v| v.to_str().ok())
                                        .map(ToString::to_string),
                                    body: String::from_utf8_lossy(&bytes).into_owned(),
                                };
                                requests.lock().expect("lock requests").push(recorded.clone());
                                let response = {
                                    let mut f = handler.lock().expect("lock handler");
                                    (f)(&recorded)
                                };
                                Ok::<_, std::convert::Infallible>(response)
                            }
                        });
                        let builder = builder.clone();
                        tokio::spawn(async move {
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                    Err(e) => {
                        eprintln!("accept error: {e}");
                        break;
                    }
                },
                _ = &mut stop_rx => break,
            }
        }
    });

    Ok(MockHost {
        addr,
        handler,
        requests,
        join,
        stop,
    })
}
