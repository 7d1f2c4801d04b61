// dtos/transactiondtos.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

use crate::service::payment_service::DepositCallback;

#[derive(Validate, Debug, Clone, Serialize, Deserialize)]
pub struct TransferDto {
    pub recipient_id: Uuid,
    #[validate(range(min = 1, max = 1000000000000, message = "Amount must be between 1 and 1000000000000"))]
    pub amount: i64,
    #[validate(length(max = 255, message = "Notes must be at most 255 characters"))]
    pub notes: Option<String>,
}

#[derive(Validate, Debug, Clone, Serialize, Deserialize)]
pub struct AdminTopupDto {
    pub user_id: Uuid,
    #[validate(range(min = 1, max = 1000000000000, message = "Amount must be between 1 and 1000000000000"))]
    pub amount: i64,
    #[validate(length(max = 255, message = "Notes must be at most 255 characters"))]
    pub notes: Option<String>,
}

#[derive(Validate, Debug, Clone, Serialize, Deserialize)]
pub struct DepositRequestDto {
    #[validate(length(min = 9, max = 15, message = "Phone number must be between 9-15 characters"))]
    pub phone_number: String,
    #[validate(range(min = 2, max = 1000000000000, message = "Amount must be between 2 and 1000000000000"))]
    pub amount: i64,
}

#[derive(Validate, Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawDto {
    #[validate(email(message = "Payout destination must be a valid email"))]
    pub destination: String,
    #[validate(range(min = 1, max = 1000000000000, message = "Amount must be between 1 and 1000000000000"))]
    pub amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowIdDto {
    pub escrow_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevenueRangeQueryDto {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct RevenueSummaryDto<T> {
    pub total_amount: i64,
    pub total_revenue: i64,
    pub count: usize,
    pub records: Vec<T>,
}

/// M-Pesa STK push result, as posted to the callback URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpesaCallbackDto {
    #[serde(rename = "Body")]
    pub body: MpesaCallbackBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpesaCallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID", default)]
    pub checkout_request_id: Option<String>,
    pub result_code: i64,
    #[serde(default)]
    pub result_desc: Option<String>,
    #[serde(default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub item: Vec<CallbackItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: Option<Value>,
}

impl StkCallback {
    fn metadata_value(&self, name: &str) -> Option<&Value> {
        self.callback_metadata
            .as_ref()?
            .item
            .iter()
            .find(|item| item.name == name)?
            .value
            .as_ref()
    }
}

impl From<MpesaCallbackDto> for DepositCallback {
    fn from(dto: MpesaCallbackDto) -> Self {
        let callback = dto.body.stk_callback;
        let amount = callback.metadata_value("Amount").and_then(|value| {
            value
                .as_i64()
                .or_else(|| value.as_f64().map(|amount| amount.round() as i64))
        });
        let phone = callback.metadata_value("PhoneNumber").map(|value| match value {
            Value::String(phone) => phone.clone(),
            other => other.to_string(),
        });

        DepositCallback {
            reference: callback.merchant_request_id,
            result_code: callback.result_code,
            result_desc: callback.result_desc,
            amount,
            phone,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn successful_callback_carries_metadata() {
        let payload = json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "ws_CO_191220191020363925",
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            { "Name": "Amount", "Value": 1.00 },
                            { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                            { "Name": "Balance" },
                            { "Name": "PhoneNumber", "Value": 254708374149u64 }
                        ]
                    }
                }
            }
        });

        let dto: MpesaCallbackDto = serde_json::from_value(payload).unwrap();
        let callback = DepositCallback::from(dto);
        assert_eq!(callback.reference, "29115-34620561-1");
        assert_eq!(callback.result_code, 0);
        assert_eq!(callback.amount, Some(1));
        assert_eq!(callback.phone.as_deref(), Some("254708374149"));
    }

    #[test]
    fn cancelled_callback_has_no_metadata() {
        let payload = json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-2",
                    "ResultCode": 1032,
                    "ResultDesc": "Request cancelled by user"
                }
            }
        });

        let callback = DepositCallback::from(serde_json::from_value::<MpesaCallbackDto>(payload).unwrap());
        assert_eq!(callback.result_code, 1032);
        assert_eq!(callback.amount, None);
        assert_eq!(callback.result_desc.as_deref(), Some("Request cancelled by user"));
    }

    #[test]
    fn deposits_below_minimum_fail_validation() {
        let dto = DepositRequestDto {
            phone_number: "0712345678".to_string(),
            amount: 1,
        };
        assert!(dto.validate().is_err());
    }

    #[test]
    fn topups_are_bounded() {
        let dto = AdminTopupDto {
            user_id: Uuid::new_v4(),
            amount: i64::MAX,
            notes: None,
        };
        assert!(dto.validate().is_err());

        let dto = AdminTopupDto {
            amount: 1_000_000_000_000,
            ..dto
        };
        assert!(dto.validate().is_ok());
    }
}
