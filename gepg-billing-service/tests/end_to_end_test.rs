//! Full bill lifecycle: submission, control number, invoice delivery,
//! payment, receipt delivery, and replay safety at the end.

mod common;

use common::TestApp;

#[tokio::test]
async fn full_bill_lifecycle_with_replay_at_the_end() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    // Submit a 100 TZS bill.
    let bill_id = app.issue_bill(100.0, Some("asha@example.com")).await;
    let bill = app.db.get_bill(&bill_id).await.unwrap().unwrap();
    assert_eq!(bill.status, "control_number_requested");

    // Control-number callback R1 makes the bill payable and sends the
    // invoice.
    let (status, body) = app.control_number_callback("R1", &bill_id, 991234, 100.0).await;
    assert_eq!(status, 200);
    assert_eq!(body["duplicate"], false);

    let bill = app.db.get_bill(&bill_id).await.unwrap().unwrap();
    assert_eq!(bill.status, "payable");
    assert_eq!(bill.cntrl_num, Some(991234));

    let records = app.wait_for_deliveries_settled(&bill_id).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].document_type, "INVOICE");
    assert_eq!(records[0].status, "sent");

    // Payment T1 marks the bill paid and sends the receipt.
    let (status, body) = app
        .payment_callback(&bill_id, "T1", 100.0, Some("asha@example.com"))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["duplicate"], false);

    let bill = app.db.get_bill(&bill_id).await.unwrap().unwrap();
    assert_eq!(bill.status, "paid");
    assert!(!bill.paid_before_payable);

    let records = app.wait_for_deliveries_settled(&bill_id).await;
    assert_eq!(records.len(), 2);
    let receipt = records.iter().find(|r| r.document_type == "RECEIPT").unwrap();
    assert_eq!(receipt.status, "sent");
    assert_eq!(app.mailer.sent_count(), 2);

    // Replaying R1 afterward changes nothing and reports duplicate.
    let (status, body) = app.control_number_callback("R1", &bill_id, 991234, 100.0).await;
    assert_eq!(status, 200);
    assert_eq!(body["duplicate"], true);

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let bill = app.db.get_bill(&bill_id).await.unwrap().unwrap();
    assert_eq!(bill.status, "paid");
    assert_eq!(app.db.list_deliveries(&bill_id).await.unwrap().len(), 2);
    assert_eq!(app.mailer.sent_count(), 2);

    app.cleanup().await;
}
