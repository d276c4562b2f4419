use crate::config::{ApiRetryConfig, BrokerEnv, Environment};
use crate::domain::errors::BrokerError;
use crate::domain::types::{Candle, Market, Quote, Stock, StockCode, OrderSide, OrderType};
use crate::infrastructure::broker::models::{
    endpoints, AccountBalance, BalanceEnvelope, BrokerPosition, DailyBarOutput, Endpoint,
    Envelope, FinancialRatios, OrderReceipt, PriceOutput,
};
use crate::infrastructure::cache::{Cache, TtlClass};
use crate::infrastructure::governor::{Governor, ALL_WINDOWS};
use crate::infrastructure::token::{TokenIssuer, TokenManager, TokenState};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rand::Rng;
use reqwest::Method;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
/// Backoff after a broker-side rate-limit response with no wait hint.
const RATE_LIMIT_BACKOFF: Duration = Duration::from_millis(600);

/// A request ready to go on the wire. Headers are regenerated for every
/// attempt, so a retry after a token refresh carries the new token.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// Transport seam: the real implementation wraps `reqwest`; tests script
/// response sequences.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: PreparedRequest) -> Result<RawResponse, BrokerError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, BrokerError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(Duration::from_secs(3))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: PreparedRequest) -> Result<RawResponse, BrokerError> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(RawResponse { status, body })
    }
}

/// Batch quote result: partial failures never abort the batch; the caller
/// gates on the success rate.
#[derive(Debug, Default)]
pub struct BatchPrices {
    pub quotes: HashMap<StockCode, Quote>,
    pub failures: Vec<(StockCode, String)>,
}

impl BatchPrices {
    pub fn success_rate(&self) -> f64 {
        let total = self.quotes.len() + self.failures.len();
        if total == 0 {
            return 1.0;
        }
        self.quotes.len() as f64 / total as f64
    }

    pub fn meets_floor(&self, floor: f64) -> bool {
        self.success_rate() >= floor
    }
}

/// Brokerage REST facade. Every call routes Governor -> Cache (when
/// cacheable) -> HTTPS with headers generated from the current token; the
/// retry policy lives here and nowhere else.
pub struct BrokerClient {
    transport: Arc<dyn HttpTransport>,
    governor: Arc<Governor>,
    tokens: Arc<TokenManager>,
    cache: Arc<Cache>,
    env: BrokerEnv,
    retry: ApiRetryConfig,
    inflight: Arc<Semaphore>,
    realtime: tokio::sync::OnceCell<Arc<super::realtime::RealtimeSession>>,
}

impl BrokerClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        governor: Arc<Governor>,
        tokens: Arc<TokenManager>,
        cache: Arc<Cache>,
        env: BrokerEnv,
        retry: ApiRetryConfig,
        max_inflight: usize,
    ) -> Self {
        Self {
            transport,
            governor,
            tokens,
            cache,
            env,
            retry,
            inflight: Arc::new(Semaphore::new(max_inflight.max(1))),
            realtime: tokio::sync::OnceCell::new(),
        }
    }

    pub fn environment(&self) -> Environment {
        self.env.environment
    }

    // ----- typed operations -------------------------------------------------

    pub async fn get_price(&self, code: &StockCode) -> Result<Quote, BrokerError> {
        self.cache
            .remember("broker.get_price", &(code.as_str(),), TtlClass::Price, || async {
                self.fetch_price(code).await
            })
            .await
    }

    async fn fetch_price(&self, code: &StockCode) -> Result<Quote, BrokerError> {
        let query = vec![
            ("FID_COND_MRKT_DIV_CODE".to_string(), "J".to_string()),
            ("FID_INPUT_ISCD".to_string(), code.as_str().to_string()),
        ];
        let output: PriceOutput = self.call(&endpoints::PRICE, query, None).await?;
        Ok(Quote {
            code: code.clone(),
            price: parse_decimal(&output.stck_prpr, "stck_prpr")?,
            change_pct: parse_decimal_or_zero(&output.prdy_ctrt),
            volume: output.acml_vol.parse().unwrap_or(0),
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    pub async fn get_daily_ohlcv(
        &self,
        code: &StockCode,
        days: usize,
    ) -> Result<Vec<Candle>, BrokerError> {
        self.cache
            .remember(
                "broker.get_daily_ohlcv",
                &(code.as_str(), days),
                TtlClass::Ohlcv,
                || async { self.fetch_daily_ohlcv(code, days).await },
            )
            .await
    }

    async fn fetch_daily_ohlcv(
        &self,
        code: &StockCode,
        days: usize,
    ) -> Result<Vec<Candle>, BrokerError> {
        let query = vec![
            ("FID_COND_MRKT_DIV_CODE".to_string(), "J".to_string()),
            ("FID_INPUT_ISCD".to_string(), code.as_str().to_string()),
            ("FID_PERIOD_DIV_CODE".to_string(), "D".to_string()),
            ("FID_ORG_ADJ_PRC".to_string(), "0".to_string()),
        ];
        let bars: Vec<DailyBarOutput> = self.call(&endpoints::DAILY_OHLCV, query, None).await?;
        let mut candles = Vec::with_capacity(bars.len().min(days));
        for bar in bars.into_iter().take(days) {
            let date = NaiveDate::parse_from_str(&bar.stck_bsop_date, "%Y%m%d").map_err(|e| {
                BrokerError::MalformedResponse {
                    reason: format!("bad bar date '{}': {e}", bar.stck_bsop_date),
                }
            })?;
            candles.push(Candle {
                code: code.clone(),
                date,
                open: parse_decimal(&bar.stck_oprc, "stck_oprc")?,
                high: parse_decimal(&bar.stck_hgpr, "stck_hgpr")?,
                low: parse_decimal(&bar.stck_lwpr, "stck_lwpr")?,
                close: parse_decimal(&bar.stck_clpr, "stck_clpr")?,
                volume: bar.acml_vol.parse().unwrap_or(0),
            });
        }
        // Oldest first, the order every indicator expects.
        candles.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(candles)
    }

    pub async fn get_financial_ratios(
        &self,
        code: &StockCode,
    ) -> Result<FinancialRatios, BrokerError> {
        self.cache
            .remember(
                "broker.get_financial_ratios",
                &(code.as_str(),),
                TtlClass::Financial,
                || async {
                    let query = vec![
                        ("FID_DIV_CLS_CODE".to_string(), "0".to_string()),
                        ("fid_cond_mrkt_div_code".to_string(), "J".to_string()),
                        ("fid_input_iscd".to_string(), code.as_str().to_string()),
                    ];
                    self.call(&endpoints::FINANCIAL_RATIOS, query, None).await
                },
            )
            .await
    }

    pub async fn get_stock_universe(&self) -> Result<Vec<Stock>, BrokerError> {
        self.cache
            .remember("broker.get_stock_universe", &(), TtlClass::Universe, || async {
                self.fetch_stock_universe().await
            })
            .await
    }

    async fn fetch_stock_universe(&self) -> Result<Vec<Stock>, BrokerError> {
        #[derive(serde::Deserialize)]
        struct UniverseRow {
            mksc_shrn_iscd: String,
            hts_kor_isnm: String,
            #[serde(default)]
            bstp_kor_isnm: String,
            #[serde(default)]
            mrkt_div: String,
        }

        let query = vec![("PRDT_TYPE_CD".to_string(), "300".to_string())];
        let rows: Vec<UniverseRow> = self.call(&endpoints::STOCK_UNIVERSE, query, None).await?;
        let mut stocks = Vec::with_capacity(rows.len());
        for row in rows {
            // Non-equity instruments in the master listing are skipped.
            let Ok(code) = StockCode::parse(&row.mksc_shrn_iscd) else {
                continue;
            };
            let market = match row.mrkt_div.as_str() {
                "Q" => Market::Kosdaq,
                _ => Market::Kospi,
            };
            stocks.push(Stock {
                code,
                name: row.hts_kor_isnm,
                market,
                sector: if row.bstp_kor_isnm.is_empty() {
                    "Unknown".to_string()
                } else {
                    row.bstp_kor_isnm
                },
            });
        }
        Ok(stocks)
    }

    pub async fn get_account_balance(&self) -> Result<AccountBalance, BrokerError> {
        let envelope = self.call_balance().await?;
        let summary = envelope
            .output2
            .first()
            .ok_or_else(|| BrokerError::MalformedResponse {
                reason: "balance response missing summary row".to_string(),
            })?;
        Ok(AccountBalance {
            total_equity: parse_decimal(&summary.tot_evlu_amt, "tot_evlu_amt")?,
            available_cash: parse_decimal_or_zero(&summary.prvs_rcdl_excc_amt),
        })
    }

    pub async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let envelope = self.call_balance().await?;
        let mut positions = Vec::new();
        for row in envelope.output1 {
            let quantity: u32 = row.hldg_qty.parse().unwrap_or(0);
            if quantity == 0 {
                continue;
            }
            positions.push(BrokerPosition {
                code: row.pdno,
                name: row.prdt_name,
                quantity,
                average_price: parse_decimal(&row.pchs_avg_pric, "pchs_avg_pric")?,
                current_price: parse_decimal(&row.prpr, "prpr")?,
            });
        }
        Ok(positions)
    }

    async fn call_balance(&self) -> Result<BalanceEnvelope, BrokerError> {
        let query = vec![
            ("CANO".to_string(), self.env.account_no.clone()),
            ("ACNT_PRDT_CD".to_string(), "01".to_string()),
            ("AFHR_FLPR_YN".to_string(), "N".to_string()),
            ("INQR_DVSN".to_string(), "02".to_string()),
            ("UNPR_DVSN".to_string(), "01".to_string()),
            ("FUND_STTL_ICLD_YN".to_string(), "N".to_string()),
            ("FNCG_AMT_AUTO_RDPT_YN".to_string(), "N".to_string()),
            ("PRCS_DVSN".to_string(), "00".to_string()),
            ("CTX_AREA_FK100".to_string(), String::new()),
            ("CTX_AREA_NK100".to_string(), String::new()),
        ];
        let raw = self.call_raw(&endpoints::BALANCE, query, None).await?;
        let envelope: BalanceEnvelope =
            serde_json::from_str(&raw).map_err(|e| BrokerError::MalformedResponse {
                reason: format!("balance envelope: {e}"),
            })?;
        if envelope.rt_cd != "0" {
            return Err(BrokerError::Api {
                code: envelope.msg_cd,
                message: envelope.msg1,
            });
        }
        Ok(envelope)
    }

    pub async fn place_order(
        &self,
        side: OrderSide,
        code: &StockCode,
        quantity: u32,
        price: Decimal,
        order_type: OrderType,
    ) -> Result<OrderReceipt, BrokerError> {
        let endpoint = match side {
            OrderSide::Buy => &endpoints::ORDER_BUY,
            OrderSide::Sell => &endpoints::ORDER_SELL,
        };
        let (division, unit_price) = match order_type {
            OrderType::Limit => ("00", price.normalize().to_string()),
            OrderType::Market => ("01", "0".to_string()),
        };
        let body = json!({
            "CANO": self.env.account_no,
            "ACNT_PRDT_CD": "01",
            "PDNO": code.as_str(),
            "ORD_DVSN": division,
            "ORD_QTY": quantity.to_string(),
            "ORD_UNPR": unit_price,
        });
        let receipt: OrderReceipt = self.call(endpoint, Vec::new(), Some(body)).await?;
        info!(
            "Order accepted: {} {} x{} @ {} (order_no {})",
            side, code, quantity, price, receipt.order_no
        );
        Ok(receipt)
    }

    pub async fn cancel_order(&self, order_no: &str) -> Result<(), BrokerError> {
        let body = json!({
            "CANO": self.env.account_no,
            "ACNT_PRDT_CD": "01",
            "KRX_FWDG_ORD_ORGNO": "06010",
            "ORGN_ODNO": order_no,
            "RVSE_CNCL_DVSN_CD": "02",
            "ORD_DVSN": "00",
            "ORD_QTY": "0",
            "ORD_UNPR": "0",
            "QTY_ALL_ORD_YN": "Y",
        });
        let _: Value = self.call(&endpoints::ORDER_CANCEL, Vec::new(), Some(body)).await?;
        info!("Order {} cancelled", order_no);
        Ok(())
    }

    /// Fetch quotes for many codes at bounded concurrency. Individual
    /// failures are reported per code and never abort the batch.
    pub async fn get_prices(&self, codes: &[StockCode]) -> BatchPrices {
        let mut tasks = Vec::with_capacity(codes.len());
        for code in codes {
            let semaphore = self.inflight.clone();
            let code = code.clone();
            let this = self;
            tasks.push(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = this.get_price(&code).await;
                (code, result)
            });
        }

        let mut batch = BatchPrices::default();
        for (code, result) in futures::future::join_all(tasks).await {
            match result {
                Ok(quote) => {
                    batch.quotes.insert(code, quote);
                }
                Err(e) => {
                    warn!("Quote fetch failed for {}: {}", code, e);
                    batch.failures.push((code, e.to_string()));
                }
            }
        }
        batch
    }

    /// Start (or retarget) the realtime quote stream. The session is
    /// created once per client, with an approval key issued by the broker.
    pub async fn subscribe_realtime(
        &self,
        codes: Vec<StockCode>,
    ) -> Result<tokio::sync::broadcast::Receiver<crate::domain::types::MarketEvent>, BrokerError>
    {
        let session = self
            .realtime
            .get_or_try_init(|| async {
                let approval_key = self.fetch_approval_key().await?;
                Ok::<_, BrokerError>(Arc::new(super::realtime::RealtimeSession::new(
                    self.env.environment.ws_url().to_string(),
                    approval_key,
                )))
            })
            .await?;
        Ok(session.subscribe(codes).await)
    }

    /// Websocket approval key; a credential exchange like the token issue,
    /// outside the governor's budget.
    async fn fetch_approval_key(&self) -> Result<String, BrokerError> {
        #[derive(serde::Deserialize)]
        struct ApprovalResponse {
            approval_key: String,
        }

        let request = PreparedRequest {
            method: Method::POST,
            url: format!("{}/oauth2/Approval", self.env.environment.base_url()),
            headers: vec![(
                "content-type".to_string(),
                "application/json; charset=utf-8".to_string(),
            )],
            query: Vec::new(),
            body: Some(json!({
                "grant_type": "client_credentials",
                "appkey": self.env.app_key,
                "secretkey": self.env.app_secret,
            })),
        };
        let response = self.transport.send(request).await?;
        if response.status >= 400 {
            return Err(BrokerError::Http {
                status: response.status,
                body: truncate(&response.body, 256),
            });
        }
        let parsed: ApprovalResponse =
            serde_json::from_str(&response.body).map_err(|e| BrokerError::MalformedResponse {
                reason: format!("approval response: {e}"),
            })?;
        Ok(parsed.approval_key)
    }

    // ----- request core -----------------------------------------------------

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &Endpoint,
        query: Vec<(String, String)>,
        body: Option<Value>,
    ) -> Result<T, BrokerError> {
        let raw = self.call_raw(endpoint, query, body).await?;
        let envelope: Envelope<T> =
            serde_json::from_str(&raw).map_err(|e| BrokerError::MalformedResponse {
                reason: format!("{}: {e}", endpoint.name),
            })?;
        envelope.into_result()
    }

    /// The single retry loop. Classification:
    /// - transient (network, 5xx, broker rate-limit): exponential backoff
    ///   with jitter, at most `retry.max_attempts` attempts;
    /// - token expired: one forced refresh, then one retry with regenerated
    ///   headers;
    /// - anything else: returned to the caller untouched.
    ///
    /// The governor is acquired immediately before each actual send; waits
    /// between retries consume no rate budget.
    async fn call_raw(
        &self,
        endpoint: &Endpoint,
        query: Vec<(String, String)>,
        body: Option<Value>,
    ) -> Result<String, BrokerError> {
        endpoint.validate_body(body.as_ref())?;

        let mut transient_attempts = 0u32;
        let mut refreshed = false;

        loop {
            self.governor.acquire(&ALL_WINDOWS).await;
            let token = self.tokens.get_valid_token().await?;
            let request = self.prepare(endpoint, &token, query.clone(), body.clone());

            let outcome = match self.transport.send(request).await {
                Ok(response) if response.status >= 500 => Err(BrokerError::Http {
                    status: response.status,
                    body: truncate(&response.body, 256),
                }),
                Ok(response) if response.status >= 400 => {
                    return Err(BrokerError::Http {
                        status: response.status,
                        body: truncate(&response.body, 256),
                    })
                }
                Ok(response) => Ok(response.body),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(raw) => {
                    // Token-expired and rate-limit envelopes are retried here;
                    // all other envelope errors surface through the typed
                    // parse in `call`.
                    match peek_error_code(&raw) {
                        Some(code) if code == super::models::CODE_TOKEN_EXPIRED => {
                            if refreshed {
                                return Err(BrokerError::TokenExpired { code });
                            }
                            info!("{}: token expired mid-request, refreshing once", endpoint.name);
                            self.tokens.refresh_after_reject(&token).await?;
                            refreshed = true;
                            continue;
                        }
                        Some(code) if code == super::models::CODE_RATE_LIMITED => {
                            transient_attempts += 1;
                            self.governor.penalize();
                            if transient_attempts >= self.retry.max_attempts {
                                return Err(BrokerError::RateLimited {
                                    retry_after_ms: RATE_LIMIT_BACKOFF.as_millis() as u64,
                                });
                            }
                            debug!("{}: broker rate limit, short backoff", endpoint.name);
                            tokio::time::sleep(RATE_LIMIT_BACKOFF).await;
                            continue;
                        }
                        _ => return Ok(raw),
                    }
                }
                Err(e) if e.is_transient() => {
                    transient_attempts += 1;
                    if transient_attempts >= self.retry.max_attempts {
                        return Err(e);
                    }
                    let delay = self.backoff_delay(transient_attempts);
                    warn!(
                        "{}: transient failure (attempt {}/{}), retrying in {:?}: {}",
                        endpoint.name, transient_attempts, self.retry.max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn prepare(
        &self,
        endpoint: &Endpoint,
        token: &str,
        query: Vec<(String, String)>,
        body: Option<Value>,
    ) -> PreparedRequest {
        let headers = vec![
            ("content-type".to_string(), "application/json; charset=utf-8".to_string()),
            ("authorization".to_string(), format!("Bearer {token}")),
            ("appkey".to_string(), self.env.app_key.clone()),
            ("appsecret".to_string(), self.env.app_secret.clone()),
            ("tr_id".to_string(), endpoint.tr_id(self.env.environment).to_string()),
            ("custtype".to_string(), "P".to_string()),
        ];
        PreparedRequest {
            method: endpoint.method.clone(),
            url: format!("{}{}", self.env.environment.base_url(), endpoint.path),
            headers,
            query,
            body,
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.retry.base_delay_ms.saturating_mul(1 << (attempt - 1).min(8));
        let capped = base.min(self.retry.max_delay_ms);
        let jitter = rand::rng().random_range(0..=capped / 2);
        Duration::from_millis(capped + jitter)
    }
}

/// Pull `rt_cd`/`msg_cd` out of a response without committing to a payload
/// type, so the retry loop can dispatch on the special codes.
fn peek_error_code(raw: &str) -> Option<String> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let rt_cd = value.get("rt_cd")?.as_str()?;
    if rt_cd == "0" {
        return None;
    }
    value
        .get("msg_cd")
        .and_then(|c| c.as_str())
        .map(|c| c.to_string())
}

fn parse_decimal(raw: &str, field: &str) -> Result<Decimal, BrokerError> {
    Decimal::from_str(raw.trim()).map_err(|e| BrokerError::MalformedResponse {
        reason: format!("bad decimal in {field}: '{raw}' ({e})"),
    })
}

fn parse_decimal_or_zero(raw: &str) -> Decimal {
    Decimal::from_str(raw.trim()).unwrap_or(Decimal::ZERO)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

/// Token issuer backed by the broker's OAuth endpoint. Bypasses the
/// governor: token issues have their own one-per-minute budget enforced by
/// the token manager.
pub struct HttpTokenIssuer {
    client: reqwest::Client,
    env: BrokerEnv,
}

impl HttpTokenIssuer {
    pub fn new(env: BrokerEnv) -> Result<Self, BrokerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, env })
    }
}

#[async_trait]
impl TokenIssuer for HttpTokenIssuer {
    async fn issue(&self) -> Result<TokenState, BrokerError> {
        #[derive(serde::Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: i64,
        }

        let url = format!("{}/oauth2/tokenP", self.env.environment.base_url());
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "grant_type": "client_credentials",
                "appkey": self.env.app_key,
                "appsecret": self.env.app_secret,
            }))
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        if status >= 400 {
            return Err(BrokerError::Http {
                status,
                body: truncate(&body, 256),
            });
        }
        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|e| BrokerError::MalformedResponse {
                reason: format!("token response: {e}"),
            })?;
        let now = Utc::now();
        Ok(TokenState {
            access_token: parsed.access_token,
            issued_at: now,
            expires_at: now + chrono::Duration::seconds(parsed.expires_in),
        })
    }
}
