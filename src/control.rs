use std::io::{self, Cursor, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::Deserialize;
use serde_json::{json, Value};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{debug, info, warn};

use crate::adapter::{Event, Message};

#[derive(Deserialize)]
struct WriteRequest {
    id: String,
    #[serde(default)]
    val: Value,
}

/// Serves the HTTP control endpoint and forwards requests to the control loop.
///
/// Every route takes a POST with a JSON body and answers with JSON:
///
/// * `/notify`: an upsmon notification, `{"notifytype":..,"upsname":..}`
/// * `/message`: any message-box request, `{"command":..,"message":..}`
/// * `/set`: an outside write, `{"id":..,"val":..}`
/// * `/dump`: the whole state tree
/// * `/stop`: unload and exit
pub fn spawn(
    addr: SocketAddr,
    events: Sender<Event>,
    stop: Arc<AtomicBool>,
) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let server = Server::http(addr).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let local = server
        .server_addr()
        .to_ip()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "control listener has no IP address"))?;
    info!("control listener on http://{}", local);

    let handle = thread::spawn(move || {
        for mut req in server.incoming_requests() {
            let (status, reply) = route(&mut req, &events, &stop);
            debug!("control {} {} -> {}", req.method(), req.url(), status);
            if let Err(e) = req.respond(json_response(status, &reply)) {
                warn!("control reply failed: {}", e);
            }
        }
    });
    Ok((local, handle))
}

/// Stops the bridge on SIGINT or SIGTERM the way a `/stop` request does.
pub fn stop_on_signals(events: Sender<Event>, stop: Arc<AtomicBool>) -> io::Result<JoinHandle<()>> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    Ok(thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!("received signal {}, stopping", signal);
            request_stop(&events, &stop);
        }
    }))
}

/// Raises the stop flag before the loop sees the event, so a poll already in
/// flight skips its error handling.
fn request_stop(events: &Sender<Event>, stop: &AtomicBool) {
    stop.store(true, Ordering::SeqCst);
    let _ = events.send(Event::Stop);
}

fn json_response(status: u16, body: &Value) -> Response<Cursor<Vec<u8>>> {
    let response = Response::from_string(body.to_string()).with_status_code(status);
    match Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    }
}

fn ok() -> Value {
    json!({ "ok": true })
}

fn failure(error: impl ToString) -> Value {
    json!({ "ok": false, "error": error.to_string() })
}

fn adapter_gone() -> (u16, Value) {
    (503, failure("bridge is shutting down"))
}

fn read_body(req: &mut Request) -> Result<Value, String> {
    let mut body = String::new();
    req.as_reader()
        .read_to_string(&mut body)
        .map_err(|e| e.to_string())?;
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).map_err(|e| e.to_string())
}

fn route(req: &mut Request, events: &Sender<Event>, stop: &AtomicBool) -> (u16, Value) {
    if *req.method() != Method::Post {
        return (405, failure("only POST is accepted"));
    }
    let path = req.url().split('?').next().unwrap_or_default().to_string();
    let body = match read_body(req) {
        Ok(body) => body,
        Err(e) => return (400, failure(e)),
    };

    match path.as_str() {
        "/notify" if body.is_object() => forward(
            events,
            Message {
                command: "notify".to_string(),
                message: Some(body),
            },
        ),
        "/notify" => (400, failure("notification must be a JSON object")),
        "/message" => match Message::deserialize(&body) {
            Ok(msg) => forward(events, msg),
            Err(e) => (400, failure(e)),
        },
        "/set" => write(events, &body),
        "/dump" => dump(events),
        "/stop" => {
            request_stop(events, stop);
            (200, ok())
        }
        _ => (404, failure(format!("no route {}", path))),
    }
}

fn forward(events: &Sender<Event>, msg: Message) -> (u16, Value) {
    match events.send(Event::Message(msg)) {
        Ok(()) => (200, ok()),
        Err(_) => adapter_gone(),
    }
}

fn write(events: &Sender<Event>, body: &Value) -> (u16, Value) {
    let write = match WriteRequest::deserialize(body) {
        Ok(write) => write,
        Err(e) => return (400, failure(e)),
    };
    let (reply, result) = mpsc::channel();
    let event = Event::Write {
        id: write.id,
        val: write.val,
        reply,
    };
    if events.send(event).is_err() {
        return adapter_gone();
    }
    match result.recv() {
        Ok(Ok(())) => (200, ok()),
        Ok(Err(e)) => (409, failure(e)),
        Err(_) => adapter_gone(),
    }
}

fn dump(events: &Sender<Event>) -> (u16, Value) {
    let (reply, tree) = mpsc::channel();
    if events.send(Event::Dump(reply)).is_err() {
        return adapter_gone();
    }
    match tree.recv() {
        Ok(tree) => (200, tree),
        Err(_) => adapter_gone(),
    }
}
