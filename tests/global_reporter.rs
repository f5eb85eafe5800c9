use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex},
};

use faultline::{
    Packet, Tags, recovery_handler, register_redaction_field, report_handler, reporter,
};
use http::{Request, Response, StatusCode};

fn boom(_response: &mut StatusCode, _request: &Request<()>) {
    panic!("boom");
}

// The reporter slot is process-wide, so everything touching it runs in one
// test.
#[test]
fn test_process_wide_reporter() {
    let packets: Arc<Mutex<Vec<Packet>>> = Arc::default();

    let sink = Arc::clone(&packets);
    reporter::install_reporter(move |packet: Packet, _tags: Option<&Tags>| {
        sink.lock().unwrap().push(packet);
    })
    .unwrap();
    assert!(reporter::installed_reporter().is_some());

    let rejected = reporter::install_reporter(|_: Packet, _: Option<&Tags>| {});
    assert_eq!(
        rejected.unwrap_err().to_string(),
        "a reporter is already installed globally"
    );

    register_redaction_field("Token");

    let request = Request::get("http://example.com/orders?api_token=abc&id=7")
        .body(())
        .unwrap();

    let handler = recovery_handler(boom);
    let mut status = StatusCode::OK;
    handler(&mut status, &request);
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let handler = report_handler(boom);
    let mut status = StatusCode::OK;
    let result = panic::catch_unwind(AssertUnwindSafe(|| handler(&mut status, &request)));
    assert!(result.is_err());
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let handler = recovery_handler(|response: &mut Response<()>, _: &Request<()>| {
        *response.status_mut() = StatusCode::NO_CONTENT;
    });
    let mut response = Response::new(());
    handler(&mut response, &request);
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let recorded = packets.lock().unwrap().clone();
    assert_eq!(recorded.len(), 2);
    for packet in &recorded {
        assert_eq!(packet.message, "boom");
        assert_eq!(packet.request.query_string(), "api_token=********&id=7");
    }

    let previous = reporter::replace_reporter(|_: Packet, _: Option<&Tags>| {});
    assert!(previous.is_some());
    let handler = recovery_handler(boom);
    handler(&mut StatusCode::OK, &request);
    assert_eq!(packets.lock().unwrap().len(), 2);
}
