pub mod bookingdb;
pub mod db;
pub mod escrowdb;
pub mod memory;
pub mod notificationdb;
pub mod transactiondb;
pub mod userdb;
pub mod walletdb;

use std::fmt::Debug;

pub use bookingdb::BookingExt;
pub use escrowdb::EscrowExt;
pub use notificationdb::NotificationExt;
pub use transactiondb::TransactionExt;
pub use userdb::UserExt;
pub use walletdb::WalletExt;

/// Everything the services need from persistence. Implemented by the Postgres
/// client and by the in-memory store.
pub trait Store:
    UserExt + WalletExt + TransactionExt + EscrowExt + BookingExt + NotificationExt + Send + Sync + Debug
{
}

impl<T> Store for T where
    T: UserExt
        + WalletExt
        + TransactionExt
        + EscrowExt
        + BookingExt
        + NotificationExt
        + Send
        + Sync
        + Debug
{
}
