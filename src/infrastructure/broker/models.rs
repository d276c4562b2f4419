use crate::domain::errors::BrokerError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Broker result code meaning "access token expired".
pub const CODE_TOKEN_EXPIRED: &str = "EGW00123";
/// Broker result code meaning "per-second rate limit exceeded".
pub const CODE_RATE_LIMITED: &str = "EGW00201";

/// Standard response envelope: success is `rt_cd == "0"`, anything else
/// carries a specific error code in `msg_cd`.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub rt_cd: String,
    #[serde(default)]
    pub msg_cd: String,
    #[serde(default)]
    pub msg1: String,
    #[serde(alias = "output1")]
    pub output: Option<T>,
}

impl<T> Envelope<T> {
    /// Map the envelope onto the error taxonomy; `Ok` carries the payload.
    pub fn into_result(self) -> Result<T, BrokerError> {
        if self.rt_cd != "0" {
            return Err(match self.msg_cd.as_str() {
                CODE_TOKEN_EXPIRED => BrokerError::TokenExpired {
                    code: self.msg_cd,
                },
                CODE_RATE_LIMITED => BrokerError::RateLimited { retry_after_ms: 0 },
                _ => BrokerError::Api {
                    code: self.msg_cd,
                    message: self.msg1,
                },
            });
        }
        self.output.ok_or_else(|| BrokerError::MalformedResponse {
            reason: "rt_cd 0 but no output payload".to_string(),
        })
    }
}

/// Quote payload (`inquire-price`).
#[derive(Debug, Clone, Deserialize)]
pub struct PriceOutput {
    /// Current price.
    pub stck_prpr: String,
    /// Change rate versus previous close, percent.
    #[serde(default)]
    pub prdy_ctrt: String,
    /// Accumulated volume.
    #[serde(default)]
    pub acml_vol: String,
}

/// One daily bar (`inquire-daily-price`).
#[derive(Debug, Clone, Deserialize)]
pub struct DailyBarOutput {
    pub stck_bsop_date: String,
    pub stck_oprc: String,
    pub stck_hgpr: String,
    pub stck_lwpr: String,
    pub stck_clpr: String,
    pub acml_vol: String,
}

/// Financial ratios payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialRatios {
    #[serde(default)]
    pub per: Option<f64>,
    #[serde(default)]
    pub pbr: Option<f64>,
    #[serde(default)]
    pub roe: Option<f64>,
    #[serde(default)]
    pub eps: Option<f64>,
}

/// Account balance summary.
#[derive(Debug, Clone)]
pub struct AccountBalance {
    pub total_equity: Decimal,
    pub available_cash: Decimal,
}

/// One holding row from the balance inquiry.
#[derive(Debug, Clone)]
pub struct BrokerPosition {
    pub code: String,
    pub name: String,
    pub quantity: u32,
    pub average_price: Decimal,
    pub current_price: Decimal,
}

/// Balance inquiry uses a two-part envelope: holdings in `output1`, account
/// summary rows in `output2`.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceEnvelope {
    pub rt_cd: String,
    #[serde(default)]
    pub msg_cd: String,
    #[serde(default)]
    pub msg1: String,
    #[serde(default)]
    pub output1: Vec<BalanceRow>,
    #[serde(default)]
    pub output2: Vec<BalanceSummaryRow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceRow {
    pub pdno: String,
    #[serde(default)]
    pub prdt_name: String,
    pub hldg_qty: String,
    pub pchs_avg_pric: String,
    pub prpr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceSummaryRow {
    /// Total evaluation amount (equity).
    pub tot_evlu_amt: String,
    /// Withdrawable cash.
    #[serde(default)]
    pub prvs_rcdl_excc_amt: String,
}

/// Order acknowledgement.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderReceipt {
    #[serde(alias = "ODNO")]
    pub order_no: String,
    #[serde(alias = "ORD_TMD", default)]
    pub order_time: String,
}

/// REST endpoint descriptor: path, per-environment transaction ids, and the
/// body fields the broker requires. Bodies are checked against
/// `required_body_fields` before anything goes on the wire.
pub struct Endpoint {
    pub name: &'static str,
    pub path: &'static str,
    pub tr_id_prod: &'static str,
    pub tr_id_virtual: &'static str,
    pub method: reqwest::Method,
    pub required_body_fields: &'static [&'static str],
}

impl Endpoint {
    pub fn tr_id(&self, environment: crate::config::Environment) -> &'static str {
        match environment {
            crate::config::Environment::Prod => self.tr_id_prod,
            crate::config::Environment::Virtual => self.tr_id_virtual,
        }
    }

    pub fn validate_body(&self, body: Option<&Value>) -> Result<(), BrokerError> {
        if self.required_body_fields.is_empty() {
            return Ok(());
        }
        let body = body.ok_or_else(|| BrokerError::SchemaViolation {
            endpoint: self.name.to_string(),
            reason: "body required but absent".to_string(),
        })?;
        for field in self.required_body_fields {
            match body.get(field) {
                Some(value) if !value.is_null() => {}
                _ => {
                    return Err(BrokerError::SchemaViolation {
                        endpoint: self.name.to_string(),
                        reason: format!("missing required field '{field}'"),
                    })
                }
            }
        }
        Ok(())
    }
}

pub mod endpoints {
    use super::Endpoint;
    use reqwest::Method;

    pub static PRICE: Endpoint = Endpoint {
        name: "inquire-price",
        path: "/uapi/domestic-stock/v1/quotations/inquire-price",
        tr_id_prod: "FHKST01010100",
        tr_id_virtual: "FHKST01010100",
        method: Method::GET,
        required_body_fields: &[],
    };

    pub static DAILY_OHLCV: Endpoint = Endpoint {
        name: "inquire-daily-price",
        path: "/uapi/domestic-stock/v1/quotations/inquire-daily-price",
        tr_id_prod: "FHKST01010400",
        tr_id_virtual: "FHKST01010400",
        method: Method::GET,
        required_body_fields: &[],
    };

    pub static FINANCIAL_RATIOS: Endpoint = Endpoint {
        name: "financial-ratio",
        path: "/uapi/domestic-stock/v1/finance/financial-ratio",
        tr_id_prod: "FHKST66430300",
        tr_id_virtual: "FHKST66430300",
        method: Method::GET,
        required_body_fields: &[],
    };

    pub static STOCK_UNIVERSE: Endpoint = Endpoint {
        name: "search-stock-info",
        path: "/uapi/domestic-stock/v1/quotations/search-stock-info",
        tr_id_prod: "CTPF1604R",
        tr_id_virtual: "CTPF1604R",
        method: Method::GET,
        required_body_fields: &[],
    };

    pub static BALANCE: Endpoint = Endpoint {
        name: "inquire-balance",
        path: "/uapi/domestic-stock/v1/trading/inquire-balance",
        tr_id_prod: "TTTC8434R",
        tr_id_virtual: "VTTC8434R",
        method: Method::GET,
        required_body_fields: &[],
    };

    pub static ORDER_BUY: Endpoint = Endpoint {
        name: "order-cash-buy",
        path: "/uapi/domestic-stock/v1/trading/order-cash",
        tr_id_prod: "TTTC0802U",
        tr_id_virtual: "VTTC0802U",
        method: Method::POST,
        required_body_fields: &["CANO", "ACNT_PRDT_CD", "PDNO", "ORD_DVSN", "ORD_QTY", "ORD_UNPR"],
    };

    pub static ORDER_SELL: Endpoint = Endpoint {
        name: "order-cash-sell",
        path: "/uapi/domestic-stock/v1/trading/order-cash",
        tr_id_prod: "TTTC0801U",
        tr_id_virtual: "VTTC0801U",
        method: Method::POST,
        required_body_fields: &["CANO", "ACNT_PRDT_CD", "PDNO", "ORD_DVSN", "ORD_QTY", "ORD_UNPR"],
    };

    pub static ORDER_CANCEL: Endpoint = Endpoint {
        name: "order-rvsecncl",
        path: "/uapi/domestic-stock/v1/trading/order-rvsecncl",
        tr_id_prod: "TTTC0803U",
        tr_id_virtual: "VTTC0803U",
        method: Method::POST,
        required_body_fields: &["CANO", "ACNT_PRDT_CD", "KRX_FWDG_ORD_ORGNO", "ORGN_ODNO"],
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_success() {
        let envelope: Envelope<PriceOutput> = serde_json::from_value(json!({
            "rt_cd": "0",
            "msg_cd": "MCA00000",
            "msg1": "OK",
            "output": {"stck_prpr": "71000", "prdy_ctrt": "1.25", "acml_vol": "1234567"}
        }))
        .unwrap();
        let output = envelope.into_result().unwrap();
        assert_eq!(output.stck_prpr, "71000");
    }

    #[test]
    fn test_envelope_token_expired() {
        let envelope: Envelope<PriceOutput> = serde_json::from_value(json!({
            "rt_cd": "1",
            "msg_cd": "EGW00123",
            "msg1": "token expired"
        }))
        .unwrap();
        assert!(matches!(
            envelope.into_result(),
            Err(BrokerError::TokenExpired { .. })
        ));
    }

    #[test]
    fn test_envelope_rate_limited() {
        let envelope: Envelope<PriceOutput> = serde_json::from_value(json!({
            "rt_cd": "1",
            "msg_cd": "EGW00201",
            "msg1": "too many requests"
        }))
        .unwrap();
        assert!(matches!(
            envelope.into_result(),
            Err(BrokerError::RateLimited { .. })
        ));
    }

    #[test]
    fn test_envelope_other_codes_are_verbatim() {
        let envelope: Envelope<PriceOutput> = serde_json::from_value(json!({
            "rt_cd": "1",
            "msg_cd": "APBK0013",
            "msg1": "주문가능금액을 초과했습니다"
        }))
        .unwrap();
        match envelope.into_result() {
            Err(BrokerError::Api { code, message }) => {
                assert_eq!(code, "APBK0013");
                assert!(message.contains("주문가능금액"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_body_validation() {
        let body = json!({
            "CANO": "12345678",
            "ACNT_PRDT_CD": "01",
            "PDNO": "005930",
            "ORD_DVSN": "00",
            "ORD_QTY": "10",
            "ORD_UNPR": "71000"
        });
        assert!(endpoints::ORDER_BUY.validate_body(Some(&body)).is_ok());

        let mut incomplete = body.clone();
        incomplete.as_object_mut().unwrap().remove("ORD_QTY");
        let err = endpoints::ORDER_BUY
            .validate_body(Some(&incomplete))
            .unwrap_err();
        assert!(matches!(err, BrokerError::SchemaViolation { .. }));

        assert!(endpoints::ORDER_BUY.validate_body(None).is_err());
        assert!(endpoints::PRICE.validate_body(None).is_ok());
    }

    #[test]
    fn test_tr_ids_differ_per_environment_for_trading() {
        use crate::config::Environment;
        assert_ne!(
            endpoints::ORDER_BUY.tr_id(Environment::Prod),
            endpoints::ORDER_BUY.tr_id(Environment::Virtual)
        );
        assert_eq!(
            endpoints::PRICE.tr_id(Environment::Prod),
            endpoints::PRICE.tr_id(Environment::Virtual)
        );
    }
}
