//! Control-number status polling tests.

mod common;

use common::TestApp;

#[tokio::test]
async fn status_moves_from_pending_to_assigned() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let bill_id = app.issue_bill(100.0, Some("asha@example.com")).await;
    let client = reqwest::Client::new();
    let url = format!("{}/bill/{}/control-number-status", app.address, bill_id);

    let body: serde_json::Value = client.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "pending");
    assert!(body["control_number"].is_null());

    app.control_number_callback("R1", &bill_id, 991234, 100.0).await;

    let body: serde_json::Value = client.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "assigned");
    assert_eq!(body["control_number"], 991234);

    app.cleanup().await;
}

#[tokio::test]
async fn status_reports_error_after_rejected_callback() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let bill_id = app.issue_bill(100.0, Some("asha@example.com")).await;

    let (status, _) = app.control_number_callback("R1", &bill_id, 991234, 90.0).await;
    assert_eq!(status, 409);

    let client = reqwest::Client::new();
    let url = format!("{}/bill/{}/control-number-status", app.address, bill_id);
    let body: serde_json::Value = client.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "error");
    assert!(body["message"]
        .as_str()
        .unwrap_or_default()
        .contains("AmountMismatch"));

    app.cleanup().await;
}

#[tokio::test]
async fn status_polling_is_side_effect_free() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let bill_id = app.issue_bill(100.0, Some("asha@example.com")).await;
    let client = reqwest::Client::new();
    let url = format!("{}/bill/{}/control-number-status", app.address, bill_id);

    for _ in 0..5 {
        let response = client.get(&url).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }
    let bill = app.db.get_bill(&bill_id).await.unwrap().unwrap();
    assert_eq!(bill.status, "control_number_requested");

    app.cleanup().await;
}

#[tokio::test]
async fn unknown_bill_status_is_not_found() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let client = reqwest::Client::new();
    let response = client
        .get(format!(
            "{}/bill/no-such-bill/control-number-status",
            app.address
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);

    app.cleanup().await;
}
