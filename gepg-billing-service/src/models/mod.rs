pub mod bill;
pub mod callback;
pub mod delivery;
pub mod payment;

pub use bill::{Bill, BillStatus, BillTrigger, Customer, NewBill, NewCustomer};
pub use callback::{CallbackKind, CallbackOutcome, GatewayCallbackRecord};
pub use delivery::{manual_event_key, DeliveryRecord, DeliveryStatus, DocumentType};
pub use payment::{NewPayment, Payment};
