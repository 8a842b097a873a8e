// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    cell::Cell,
    fmt::Debug,
    net::IpAddr,
    sync::{Arc, mpsc},
    thread,
};

use once_cell::sync::OnceCell;
use serde_json::json;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{layer::Context, registry::LookupSpan};

use crate::http::{WebMethod, client::WebClient};

thread_local! {
    /// Set on the shipper thread so its own activity can never feed back
    /// into the layer.
    static IN_SHIPPER: Cell<bool> = const { Cell::new(false) };
}

#[derive(Debug, Clone)]
struct ShipRecord {
    level: String,
    message: String,
    exception: Option<String>,
}

/// Remote log shipper (C14): a subscriber layer that forwards WARNING and
/// higher records to the backend's `/log` endpoint over `SECURE`.
///
/// The layer is installed at logger init but stays dormant until `arm` is
/// called with the backend address and session token after login. Records
/// travel over a bounded channel to a dedicated thread; when the channel is
/// full or shipping fails the record is dropped and the failure goes to
/// stderr, never back into the logger.
#[derive(Clone, Default)]
pub struct RemoteLogLayer {
    tx: Arc<OnceCell<mpsc::SyncSender<ShipRecord>>>,
}

impl RemoteLogLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the shipping thread. Called once, after login.
    pub fn arm(&self, ip: IpAddr, port: u16, token: String) {
        let (tx, rx) = mpsc::sync_channel::<ShipRecord>(64);
        if self.tx.set(tx).is_err() {
            return;
        }

        let spawned = thread::Builder::new()
            .name("LogShipper".to_string())
            .spawn(move || {
                IN_SHIPPER.with(|flag| flag.set(true));
                for record in rx {
                    let mut body = json!({
                        "level": record.level,
                        "message": record.message,
                    });
                    if let (Some(exception), Some(map)) =
                        (record.exception, body.as_object_mut())
                    {
                        map.insert("exception".to_string(), json!(exception));
                    }

                    let result = WebClient::new(ip, port)
                        .set_secure(true)
                        .set_method(WebMethod::Post)
                        .set_path("/log")
                        .authorize(Some(&token))
                        .set_json(body)
                        .send();
                    if let Err(e) = result {
                        eprintln!("failed to ship log record: {e:#}");
                    }
                }
            });
        if let Err(e) = spawned {
            eprintln!("failed to spawn log shipper: {e}");
        }
    }
}

struct RecordVisitor {
    message: String,
    exception: Option<String>,
}

impl tracing::field::Visit for RecordVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            "exception" => self.exception = Some(format!("{value:?}")),
            _ => {},
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "exception" => self.exception = Some(value.to_string()),
            _ => {},
        }
    }
}

impl<S> tracing_subscriber::Layer<S> for RemoteLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(tx) = self.tx.get() else {
            return;
        };
        if IN_SHIPPER.with(Cell::get) {
            return;
        }
        if *event.metadata().level() > Level::WARN {
            return;
        }

        let mut visitor = RecordVisitor {
            message: String::new(),
            exception: None,
        };
        event.record(&mut visitor);

        let record = ShipRecord {
            level: match *event.metadata().level() {
                Level::ERROR => "ERROR".to_string(),
                _ => "WARNING".to_string(),
            },
            message: visitor.message,
            exception: visitor.exception,
        };

        // try_send: a stalled backend must not block application threads.
        let _ = tx.try_send(record);
    }
}
