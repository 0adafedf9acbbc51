//! Newline-delimited JSON protocol. One request object per line, one response per line,
//! answered in order.
//!
//! ```text
//! → {"op":"list_slots","date":"2026-10-19","timezone":"Europe/Berlin"}
//! ← {"ok":true,"data":[{"id":"20261019-0900","time":"11:00",...}]}
//! → {"op":"cancel","meeting_id":"01J..."}
//! ← {"ok":false,"error":{"kind":"not_found","message":"not found: meeting 01J...","fields":[]}}
//! ```

use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::booking::{parse_meeting_id, BookingError, BookingService, RescheduleRequest, ScheduleRequest};
use crate::limits::MAX_REQUEST_LINE_BYTES;
use crate::model::MeetingStatus;
use crate::observability::{request_label, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};

fn default_timezone() -> String {
    "UTC".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    ListSlots {
        date: String,
        #[serde(default = "default_timezone")]
        timezone: String,
    },
    Schedule(ScheduleRequest),
    Cancel {
        meeting_id: String,
    },
    Reschedule(RescheduleRequest),
    GetMeeting {
        meeting_id: String,
    },
    MeetingsForCar {
        car_id: String,
    },
    MeetingsForOwner {
        owner_id: String,
        #[serde(default)]
        status: Option<MeetingStatus>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn data(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(kind: &str, message: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind: kind.to_string(),
                message: message.into(),
                fields,
            }),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::failure("bad_request", message, Vec::new())
    }

    /// `"ok"` or the error kind; used as the status metric label.
    pub fn status(&self) -> String {
        match &self.error {
            Some(e) => e.kind.clone(),
            None => "ok".into(),
        }
    }
}

impl From<&BookingError> for Response {
    fn from(e: &BookingError) -> Self {
        Response::failure(
            e.kind(),
            e.to_string(),
            e.fields().into_iter().map(str::to_string).collect(),
        )
    }
}

fn respond<T: Serialize>(result: Result<T, BookingError>) -> Response {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(data) => Response::data(data),
            Err(e) => Response::failure("internal", e.to_string(), Vec::new()),
        },
        Err(e) => Response::from(&e),
    }
}

fn parse_date(field: &'static str, value: &str) -> Result<NaiveDate, BookingError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| BookingError::field(field, "expected YYYY-MM-DD"))
}

/// Execute one decoded request.
pub async fn handle(service: &BookingService, req: Request) -> Response {
    match req {
        Request::ListSlots { date, timezone } => respond(
            parse_date("date", &date).and_then(|date| service.available_slots(date, &timezone)),
        ),
        Request::Schedule(r) => respond(service.schedule(&r).await),
        Request::Cancel { meeting_id } => match parse_meeting_id(&meeting_id) {
            Ok(id) => respond(service.cancel(id).await),
            Err(e) => Response::from(&e),
        },
        Request::Reschedule(r) => respond(service.reschedule(&r).await),
        Request::GetMeeting { meeting_id } => match parse_meeting_id(&meeting_id) {
            Ok(id) => respond(service.get_meeting(id).await),
            Err(e) => Response::from(&e),
        },
        Request::MeetingsForCar { car_id } => respond(service.meetings_for_car(&car_id).await),
        Request::MeetingsForOwner { owner_id, status } => {
            respond(service.meetings_for_owner(&owner_id, status).await)
        }
    }
}

/// Decode, execute and record metrics for one request line.
pub async fn dispatch(service: &BookingService, line: &str) -> Response {
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            metrics::counter!(REQUESTS_TOTAL, "op" => "unknown", "status" => "bad_request").increment(1);
            return Response::bad_request(format!("malformed request: {e}"));
        }
    };
    let op = request_label(&req);
    let started = Instant::now();
    let response = handle(service, req).await;
    metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());
    metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => response.status()).increment(1);
    if let Some(e) = &response.error {
        tracing::debug!("{op} failed: {}", e.message);
    }
    response
}

/// Serve one client until it disconnects.
pub async fn process_connection<S>(socket: S, service: Arc<BookingService>) -> Result<(), LinesCodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut lines = Framed::new(socket, LinesCodec::new_with_max_length(MAX_REQUEST_LINE_BYTES));
    while let Some(line) = lines.next().await {
        let response = match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => dispatch(&service, &line).await,
            // The codec skips the rest of the oversized line and keeps going.
            Err(LinesCodecError::MaxLineLengthExceeded) => Response::bad_request("request line too long"),
            Err(e) => return Err(e),
        };
        let text = serde_json::to_string(&response).map_err(|e| LinesCodecError::Io(std::io::Error::other(e)))?;
        lines.send(text).await?;
    }
    Ok(())
}
