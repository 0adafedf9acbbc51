use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Days, NaiveDate, Weekday};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use ulid::Ulid;

use slotbook::availability::AvailabilityStore;
use slotbook::booking::{BookingService, ScheduleRequest};
use slotbook::catalog::MeetingCatalog;
use slotbook::config::BookingConfig;
use slotbook::model::SlotKey;
use slotbook::policy::BusinessHoursPolicy;
use slotbook::store::WalStore;
use slotbook::wire;

// ── Test infrastructure ──────────────────────────────────────

fn data_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("slotbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn build_service(dir: &Path) -> Arc<BookingService> {
    let store = Arc::new(WalStore::open(&dir.join("meetings.wal")).unwrap());
    let slots = Arc::new(AvailabilityStore::new(Arc::new(BusinessHoursPolicy::default())));
    Arc::new(BookingService::new(
        slots,
        store,
        MeetingCatalog::default(),
        BookingConfig {
            join_url_base: "https://meet.example.test".into(),
            ..BookingConfig::default()
        },
    ))
}

async fn start_test_server() -> (SocketAddr, Arc<BookingService>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = build_service(&data_dir());

    let svc = service.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let svc = svc.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, svc).await;
            });
        }
    });

    (addr, service)
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let (read, write) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    async fn call(&mut self, request: Value) -> Value {
        let mut line = request.to_string();
        line.push('\n');
        self.write.write_all(line.as_bytes()).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("reply timed out")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&reply).unwrap()
    }

    /// Call and unwrap `data`, failing the test on an error response.
    async fn ok(&mut self, request: Value) -> Value {
        let reply = self.call(request).await;
        assert_eq!(reply["ok"], json!(true), "unexpected error: {reply}");
        reply["data"].clone()
    }
}

fn next(day: Weekday, today: NaiveDate) -> NaiveDate {
    let mut d = today + Days::new(1);
    while d.weekday() != day {
        d = d + Days::new(1);
    }
    d
}

fn schedule(slot_id: &str, meeting_type: &str) -> Value {
    json!({
        "op": "schedule",
        "car_id": "car-42",
        "owner_id": "dealer-9",
        "type": meeting_type,
        "slot_id": slot_id,
        "name": "Ada Lovelace",
        "email": "ada@example.com",
        "phone": "+44 20 7946 0000",
        "timezone": "Europe/London",
    })
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn list_book_and_cancel_over_tcp() {
    let (addr, service) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let monday = next(Weekday::Mon, service.slots().today());

    let slots = client
        .ok(json!({ "op": "list_slots", "date": monday.to_string(), "timezone": "UTC" }))
        .await;
    let slots = slots.as_array().unwrap();
    assert_eq!(slots.len(), 14);
    assert_eq!(slots[0]["time"], json!("09:00"));
    assert_eq!(slots[0]["available"], json!(true));
    assert_eq!(slots[0]["durations"], json!([30, 60]));
    let s1 = slots[0]["id"].as_str().unwrap().to_string();

    let meeting = client.ok(schedule(&s1, "video_call_google_meet")).await;
    assert_eq!(meeting["status"], json!("scheduled"));
    assert_eq!(meeting["slot_id"], json!(s1));
    let id = meeting["id"].as_str().unwrap().to_string();
    assert_eq!(
        meeting["join_url"],
        json!(format!("https://meet.example.test/google_meet/{id}"))
    );

    let taken = client.call(schedule(&s1, "dealership_visit")).await;
    assert_eq!(taken["ok"], json!(false));
    assert_eq!(taken["error"]["kind"], json!("slot_unavailable"));

    let listed = client
        .ok(json!({ "op": "list_slots", "date": monday.to_string() }))
        .await;
    assert_eq!(listed[0]["available"], json!(false));

    let cancelled = client.ok(json!({ "op": "cancel", "meeting_id": id })).await;
    assert_eq!(cancelled["status"], json!("cancelled"));
    client.ok(schedule(&s1, "dealership_visit")).await;
}

#[tokio::test]
async fn reschedule_and_projections_over_tcp() {
    let (addr, service) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let today = service.slots().today();
    let (tue, wed) = (next(Weekday::Tue, today), next(Weekday::Wed, today));
    let s1 = format!("{}-1000", tue.format("%Y%m%d"));
    let s2 = format!("{}-1430", wed.format("%Y%m%d"));

    let meeting = client.ok(schedule(&s1, "dealership_visit")).await;
    let id = meeting["id"].as_str().unwrap().to_string();

    let moved = client
        .ok(json!({ "op": "reschedule", "meeting_id": id, "new_slot_id": s2 }))
        .await;
    assert_eq!(moved["slot_id"], json!(s2));
    assert_eq!(moved["scheduled_date"], json!(wed.to_string()));
    assert!(service.slots().is_available(&SlotKey::new(tue, s1.clone())));
    assert!(!service.slots().is_available(&SlotKey::new(wed, s2.clone())));

    let by_car = client.ok(json!({ "op": "meetings_for_car", "car_id": "car-42" })).await;
    assert_eq!(by_car.as_array().unwrap().len(), 1);
    let active = client
        .ok(json!({ "op": "meetings_for_owner", "owner_id": "dealer-9", "status": "scheduled" }))
        .await;
    assert_eq!(active[0]["id"], json!(id));
    let fetched = client.ok(json!({ "op": "get_meeting", "meeting_id": id })).await;
    assert_eq!(fetched["slot_id"], json!(s2));
}

#[tokio::test]
async fn errors_carry_kind_and_fields() {
    let (addr, service) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let monday = next(Weekday::Mon, service.slots().today());

    let invalid = client
        .call(json!({ "op": "schedule", "slot_id": format!("{}-0900", monday.format("%Y%m%d")) }))
        .await;
    assert_eq!(invalid["error"]["kind"], json!("validation"));
    let mut fields: Vec<String> = serde_json::from_value(invalid["error"]["fields"].clone()).unwrap();
    fields.sort();
    assert_eq!(fields, vec!["car_id", "email", "name", "timezone", "type"]);

    let missing = client
        .call(json!({ "op": "get_meeting", "meeting_id": Ulid::new().to_string() }))
        .await;
    assert_eq!(missing["error"]["kind"], json!("not_found"));

    let garbage = client.call(json!({ "op": "explode" })).await;
    assert_eq!(garbage["error"]["kind"], json!("bad_request"));

    let zone = client
        .call(json!({ "op": "list_slots", "date": monday.to_string(), "timezone": "Moon/Base" }))
        .await;
    assert_eq!(zone["error"]["fields"], json!(["timezone"]));

    // The connection survives errors.
    client.ok(json!({ "op": "meetings_for_car", "car_id": "x" })).await;
}

#[tokio::test]
async fn concurrent_clients_never_double_book() {
    let (addr, service) = start_test_server().await;
    let thursday = next(Weekday::Thu, service.slots().today());
    let slot = format!("{}-1300", thursday.format("%Y%m%d"));

    let mut handles = Vec::new();
    for _ in 0..12 {
        let slot = slot.clone();
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            client.call(schedule(&slot, "virtual_tour")).await
        }));
    }
    let mut wins = 0;
    for h in handles {
        let reply = h.await.unwrap();
        if reply["ok"] == json!(true) {
            wins += 1;
        } else {
            assert_eq!(reply["error"]["kind"], json!("slot_unavailable"));
        }
    }
    assert_eq!(wins, 1);
}

#[tokio::test]
async fn holds_are_rebuilt_after_restart() {
    let dir = data_dir();
    let friday;
    let kept_id;
    {
        let service = build_service(&dir);
        friday = next(Weekday::Fri, service.slots().today());
        let req = |slot: &str| ScheduleRequest {
            car_id: "car-1".into(),
            meeting_type: "dealership_visit".into(),
            slot_id: slot.into(),
            name: "Grace".into(),
            email: "grace@example.com".into(),
            timezone: "UTC".into(),
            ..Default::default()
        };
        let day = friday.format("%Y%m%d");
        kept_id = service.schedule(&req(&format!("{day}-0900"))).await.unwrap().id;
        let gone = service.schedule(&req(&format!("{day}-0930"))).await.unwrap();
        service.cancel(gone.id).await.unwrap();
    }

    let service = build_service(&dir);
    let report = service.reconcile(Duration::ZERO).await.unwrap();
    assert_eq!(report.restored, 1);
    let day = friday.format("%Y%m%d");
    let kept = SlotKey::new(friday, format!("{day}-0900"));
    assert_eq!(service.slots().holder_of(&kept), Some(kept_id));
    assert!(service.slots().is_available(&SlotKey::new(friday, format!("{day}-0930"))));
    assert_eq!(service.meetings_for_car("car-1").await.unwrap().len(), 2);
}
