pub mod unread_reconcile;

pub use unread_reconcile::UnreadReconcileWorker;
