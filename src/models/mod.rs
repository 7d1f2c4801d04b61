pub mod bookingmodel;
pub mod escrowmodels;
pub mod notificationmodel;
pub mod usermodel;
pub mod walletmodels;
