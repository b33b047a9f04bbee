//! Domain operations. Every call takes the tenant it acts on and reaches the
//! data only through that tenant's scoped client.

pub mod complexes;
pub mod panic;
pub mod payments;
pub mod pdf;
pub mod reconciliation;
pub mod reports;

pub use complexes::ComplexService;
pub use panic::PanicAlertService;
pub use payments::PaymentService;
pub use reconciliation::{ReconciliationConfig, ReconciliationService};
pub use reports::ReportService;
