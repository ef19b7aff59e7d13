//! Scripted payment gateway for tests and local development

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::gateway::{
    CancelReceipt, CardDetails, ChargeReceipt, ChargeRequest, GatewayError, GatewayPaymentStatus,
    IssuedBillingKey, PaymentGateway, mask_card_number,
};

/// Scripted reply to one charge
#[derive(Debug, Clone)]
pub enum ScriptedCharge {
    Done,
    Rejected { code: String, message: String },
    /// Client-side timeout reported by the HTTP layer
    Timeout,
    /// Never answers within any reasonable timeout
    Hang,
    /// Answers with a non-final status
    Status(GatewayPaymentStatus),
}

impl ScriptedCharge {
    pub fn rejected(code: &str) -> Self {
        ScriptedCharge::Rejected {
            code: code.to_string(),
            message: format!("{} from gateway", code),
        }
    }
}

/// Cancel request seen by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelCall {
    pub payment_key: String,
    pub reason: String,
    pub amount: Option<i64>,
}

/// Gateway double replaying queued outcomes; `Done` once the queue is empty
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<ScriptedCharge>>,
    charges: Mutex<Vec<ChargeRequest>>,
    cancels: Mutex<Vec<CancelCall>>,
    fail_cancels: AtomicBool,
    sequence: AtomicUsize,
}

fn locked<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: ScriptedCharge) {
        locked(&self.script).push_back(outcome);
    }

    pub fn push_many(&self, outcomes: impl IntoIterator<Item = ScriptedCharge>) {
        locked(&self.script).extend(outcomes);
    }

    pub fn fail_cancels(&self, fail: bool) {
        self.fail_cancels.store(fail, Ordering::SeqCst);
    }

    /// Every charge request received, in order
    pub fn charges(&self) -> Vec<ChargeRequest> {
        locked(&self.charges).clone()
    }

    pub fn charge_count(&self) -> usize {
        locked(&self.charges).len()
    }

    pub fn cancels(&self) -> Vec<CancelCall> {
        locked(&self.cancels).clone()
    }

    fn next_key(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn issue_billing_key(
        &self,
        _customer_key: &str,
        card: &CardDetails,
    ) -> Result<IssuedBillingKey, GatewayError> {
        if card.card_number.chars().filter(|c| c.is_ascii_digit()).count() < 12 {
            return Err(GatewayError::Rejected {
                code: "INVALID_CARD_NUMBER".to_string(),
                message: "카드번호를 다시 확인해주세요.".to_string(),
            });
        }
        Ok(IssuedBillingKey {
            billing_key: self.next_key("bk"),
            card_company: Some("신한".to_string()),
            card_number: Some(mask_card_number(&card.card_number)),
            card_type: Some("신용".to_string()),
        })
    }

    async fn charge_billing_key(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeReceipt, GatewayError> {
        locked(&self.charges).push(request.clone());
        let outcome = locked(&self.script)
            .pop_front()
            .unwrap_or(ScriptedCharge::Done);

        let status = match outcome {
            ScriptedCharge::Done => GatewayPaymentStatus::Done,
            ScriptedCharge::Rejected { code, message } => {
                return Err(GatewayError::Rejected { code, message })
            }
            ScriptedCharge::Timeout => return Err(GatewayError::Timeout),
            ScriptedCharge::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Err(GatewayError::Timeout);
            }
            ScriptedCharge::Status(status) => status,
        };

        Ok(ChargeReceipt {
            payment_key: self.next_key("pk"),
            order_id: request.order_id.clone(),
            status,
            approved_at: None,
            total_amount: request.amount,
            card_company: Some("신한".to_string()),
            card_number: Some("4330********5678".to_string()),
            receipt_url: None,
        })
    }

    async fn cancel_payment(
        &self,
        payment_key: &str,
        reason: &str,
        amount: Option<i64>,
    ) -> Result<CancelReceipt, GatewayError> {
        locked(&self.cancels).push(CancelCall {
            payment_key: payment_key.to_string(),
            reason: reason.to_string(),
            amount,
        });
        if self.fail_cancels.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected {
                code: "NOT_CANCELABLE_PAYMENT".to_string(),
                message: "취소할 수 없는 결제입니다.".to_string(),
            });
        }
        Ok(CancelReceipt {
            payment_key: payment_key.to_string(),
            status: if amount.is_some() {
                GatewayPaymentStatus::PartialCanceled
            } else {
                GatewayPaymentStatus::Canceled
            },
            refund_key: Some(self.next_key("tx")),
            canceled_amount: amount.unwrap_or(0),
        })
    }
}
