//! Gateway callback integration tests: idempotency, validation rejections
//! and the out-of-order payment race.

mod common;

use common::TestApp;

#[tokio::test]
async fn control_number_callback_is_idempotent_per_req_id() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let bill_id = app.issue_bill(100.0, Some("asha@example.com")).await;

    let (status, body) = app.control_number_callback("R1", &bill_id, 991234, 100.0).await;
    assert_eq!(status, 200);
    assert_eq!(body["duplicate"], false);

    let bill = app.db.get_bill(&bill_id).await.unwrap().unwrap();
    assert_eq!(bill.status, "payable");
    assert_eq!(bill.cntrl_num, Some(991234));

    let (status, body) = app.control_number_callback("R1", &bill_id, 991234, 100.0).await;
    assert_eq!(status, 200);
    assert_eq!(body["duplicate"], true);

    let bill = app.db.get_bill(&bill_id).await.unwrap().unwrap();
    assert_eq!(bill.status, "payable");
    assert_eq!(bill.cntrl_num, Some(991234));

    app.cleanup().await;
}

#[tokio::test]
async fn amount_mismatch_is_rejected_and_key_not_consumed() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let bill_id = app.issue_bill(100.0, Some("asha@example.com")).await;

    let (status, _) = app.control_number_callback("R1", &bill_id, 991234, 90.0).await;
    assert_eq!(status, 409);

    let bill = app.db.get_bill(&bill_id).await.unwrap().unwrap();
    assert_eq!(bill.cntrl_num, None);
    assert_eq!(bill.status, "control_number_requested");

    // A corrected retry under the same req_id must still be applicable.
    let (status, body) = app.control_number_callback("R1", &bill_id, 991234, 100.0).await;
    assert_eq!(status, 200);
    assert_eq!(body["duplicate"], false);

    let bill = app.db.get_bill(&bill_id).await.unwrap().unwrap();
    assert_eq!(bill.cntrl_num, Some(991234));

    app.cleanup().await;
}

#[tokio::test]
async fn conflicting_control_number_does_not_overwrite() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let bill_id = app.issue_bill(100.0, Some("asha@example.com")).await;

    let (status, _) = app.control_number_callback("R1", &bill_id, 991234, 100.0).await;
    assert_eq!(status, 200);

    let (status, _) = app.control_number_callback("R2", &bill_id, 995678, 100.0).await;
    assert_eq!(status, 409);

    let bill = app.db.get_bill(&bill_id).await.unwrap().unwrap();
    assert_eq!(bill.cntrl_num, Some(991234));

    app.cleanup().await;
}

#[tokio::test]
async fn same_control_number_under_new_req_id_is_accepted_noop() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let bill_id = app.issue_bill(100.0, Some("asha@example.com")).await;

    app.control_number_callback("R1", &bill_id, 991234, 100.0).await;
    let (status, body) = app.control_number_callback("R2", &bill_id, 991234, 100.0).await;
    assert_eq!(status, 200);
    assert_eq!(body["duplicate"], false);

    let bill = app.db.get_bill(&bill_id).await.unwrap().unwrap();
    assert_eq!(bill.cntrl_num, Some(991234));
    assert_eq!(bill.status, "payable");

    app.cleanup().await;
}

#[tokio::test]
async fn unknown_bill_reference_is_rejected() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let (status, _) = app
        .control_number_callback("R1", "HQ01-no-such-bill", 991234, 100.0)
        .await;
    assert_eq!(status, 400);

    let (status, _) = app
        .payment_callback("HQ01-no-such-bill", "T1", 100.0, None)
        .await;
    assert_eq!(status, 400);

    app.cleanup().await;
}

#[tokio::test]
async fn payment_callback_is_idempotent_per_trx_id() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let bill_id = app.issue_bill(100.0, Some("asha@example.com")).await;
    app.control_number_callback("R1", &bill_id, 991234, 100.0).await;

    let (status, body) = app.payment_callback(&bill_id, "T1", 100.0, None).await;
    assert_eq!(status, 200);
    assert_eq!(body["duplicate"], false);

    for _ in 0..3 {
        let (status, body) = app.payment_callback(&bill_id, "T1", 100.0, None).await;
        assert_eq!(status, 200);
        assert_eq!(body["duplicate"], true);
    }

    let bill = app.db.get_bill(&bill_id).await.unwrap().unwrap();
    assert_eq!(bill.status, "paid");
    let payment = app.db.get_payment_for_bill(&bill_id).await.unwrap().unwrap();
    assert_eq!(payment.trx_id, "T1");

    app.cleanup().await;
}

#[tokio::test]
async fn second_payment_with_fresh_trx_id_is_absorbed_as_duplicate() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let bill_id = app.issue_bill(100.0, Some("asha@example.com")).await;
    app.control_number_callback("R1", &bill_id, 991234, 100.0).await;
    app.payment_callback(&bill_id, "T1", 100.0, None).await;

    let (status, body) = app.payment_callback(&bill_id, "T2", 100.0, None).await;
    assert_eq!(status, 200);
    assert_eq!(body["duplicate"], true);

    let payment = app.db.get_payment_for_bill(&bill_id).await.unwrap().unwrap();
    assert_eq!(payment.trx_id, "T1");

    app.cleanup().await;
}

#[tokio::test]
async fn payment_may_arrive_before_control_number() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let bill_id = app.issue_bill(100.0, Some("asha@example.com")).await;

    let (status, body) = app.payment_callback(&bill_id, "T1", 100.0, None).await;
    assert_eq!(status, 200);
    assert_eq!(body["duplicate"], false);

    let bill = app.db.get_bill(&bill_id).await.unwrap().unwrap();
    assert_eq!(bill.status, "paid");
    assert!(bill.paid_before_payable);

    // The late control-number callback still assigns the number but must
    // not downgrade the paid status.
    let (status, _) = app.control_number_callback("R1", &bill_id, 991234, 100.0).await;
    assert_eq!(status, 200);
    let bill = app.db.get_bill(&bill_id).await.unwrap().unwrap();
    assert_eq!(bill.status, "paid");
    assert_eq!(bill.cntrl_num, Some(991234));

    app.cleanup().await;
}

#[tokio::test]
async fn malformed_callback_bodies_are_rejected() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/bill-cntrl-num-response-callback", app.address))
        .json(&serde_json::json!({
            "req_id": "",
            "bill_id": "B1",
            "cntrl_num": 991234,
            "bill_amt": 100.0
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let response = client
        .post(format!("{}/bill-cntrl-num-payment-callback", app.address))
        .json(&serde_json::json!({
            "bill_id": "B1",
            "trx_id": "T1"
        }))
        .send()
        .await
        .unwrap();
    // Missing required fields fail deserialization.
    assert!(response.status().is_client_error());

    app.cleanup().await;
}
