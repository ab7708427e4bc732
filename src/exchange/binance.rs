//! Binance spot REST client.

use super::ExchangeApi;
use crate::config::Config;
use crate::error::ArbError;
use crate::market::{
    Account, Balance, Coin, Depth, DepthLevel, ExchangeInfo, Fill, OrderAck, OrderRequest,
    OrderStatus, OrderType, Ticker, TickersMap, TimeInForce,
};
use crate::utils::unix_millis;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use log::{debug, warn};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

const EXCHANGE_INFO_PATH: &str = "/api/v3/exchangeInfo";
const BOOK_TICKER_PATH: &str = "/api/v3/ticker/bookTicker";
const DEPTH_PATH: &str = "/api/v3/depth";
const ACCOUNT_PATH: &str = "/api/v3/account";
const ORDER_PATH: &str = "/api/v3/order";
const ORDER_TEST_PATH: &str = "/api/v3/order/test";
const USER_DATA_STREAM_PATH: &str = "/api/v3/userDataStream";

const API_KEY_HEADER: &str = "X-MBX-APIKEY";
const RECV_WINDOW_MS: u64 = 5000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBookTicker {
    symbol: String,
    bid_price: String,
    bid_qty: String,
    ask_price: String,
    ask_qty: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDepth {
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    asset: String,
    free: String,
    locked: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAccount {
    #[serde(default)]
    update_time: i64,
    balances: Vec<RawBalance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFill {
    price: String,
    qty: String,
    commission: String,
    commission_asset: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrderResponse {
    symbol: String,
    order_id: i64,
    client_order_id: String,
    transact_time: i64,
    price: String,
    orig_qty: String,
    executed_qty: String,
    cummulative_quote_qty: String,
    status: String,
    time_in_force: String,
    #[serde(default)]
    fills: Vec<RawFill>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenKeyResponse {
    listen_key: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

fn parse_f64(raw: &str) -> Result<f64, ArbError> {
    Ok(raw.parse::<f64>()?)
}

fn parse_levels(raw: Vec<[String; 2]>) -> Result<Vec<DepthLevel>, ArbError> {
    raw.into_iter()
        .map(|[price, qty]| {
            Ok(DepthLevel {
                price: parse_f64(&price)?,
                qty: parse_f64(&qty)?,
            })
        })
        .collect()
}

/// Decimal rendering accepted by the order endpoint: at most 8 decimals, no trailing zeros.
pub fn format_decimal(value: f64) -> String {
    let fixed = format!("{:.8}", value);
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Query string covered by the signature. The serializer is not `Send`, so it never lives
/// across an await.
fn signed_query(params: &[(&str, String)], timestamp_ms: i64) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        query.append_pair(key, value);
    }
    query.append_pair("recvWindow", &RECV_WINDOW_MS.to_string());
    query.append_pair("timestamp", &timestamp_ms.to_string());
    query.finish()
}

/// Hex HMAC-SHA256 of `payload`.
pub fn sign(secret: &str, payload: &str) -> Result<String, ArbError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ArbError::ConfigError(format!("HMAC key error: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

impl RawOrderResponse {
    fn into_ack(self) -> Result<OrderAck, ArbError> {
        Ok(OrderAck {
            symbol: self.symbol,
            order_id: self.order_id,
            client_order_id: self.client_order_id,
            status: OrderStatus::parse(&self.status),
            price: parse_f64(&self.price)?,
            orig_qty: parse_f64(&self.orig_qty)?,
            executed_qty: parse_f64(&self.executed_qty)?,
            cumulative_quote_qty: parse_f64(&self.cummulative_quote_qty)?,
            time_in_force: if self.time_in_force == "GTC" {
                TimeInForce::Gtc
            } else {
                TimeInForce::Ioc
            },
            transact_time: self.transact_time,
            fills: self
                .fills
                .into_iter()
                .map(|f| {
                    Ok(Fill {
                        price: parse_f64(&f.price)?,
                        qty: parse_f64(&f.qty)?,
                        commission: parse_f64(&f.commission)?,
                        commission_asset: f.commission_asset,
                    })
                })
                .collect::<Result<Vec<_>, ArbError>>()?,
        })
    }
}

pub struct BinanceClient {
    http: Client,
    api_url: Url,
    ws_url: String,
    api_key: String,
    api_secret: String,
}

impl BinanceClient {
    pub fn new(api_url: &str, ws_url: &str, api_key: &str, api_secret: &str) -> Result<Self, ArbError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ArbError::NetworkError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(BinanceClient {
            http,
            api_url: Url::parse(api_url)?,
            ws_url: ws_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ArbError> {
        BinanceClient::new(
            &config.binance_api_url,
            &config.binance_ws_url,
            &config.binance_api_key,
            &config.binance_api_secret,
        )
    }

    fn endpoint(&self, path: &str) -> Result<Url, ArbError> {
        Ok(self.api_url.join(path)?)
    }

    async fn check(response: Response) -> Result<Response, ArbError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(err) => format!("HTTP {} code {}: {}", status, err.code, err.msg),
            Err(_) => format!("HTTP {}: {}", status, body),
        };
        if status.is_server_error() || status.as_u16() == 429 || status.as_u16() == 418 {
            Err(ArbError::NetworkError(message))
        } else {
            Err(ArbError::ExchangeError(message))
        }
    }

    async fn get_public<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ArbError> {
        let url = self.endpoint(path)?;
        let response = self.http.get(url).query(query).send().await?;
        Ok(Self::check(response).await?.json::<T>().await?)
    }

    async fn send_signed(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        timestamp_ms: i64,
    ) -> Result<Response, ArbError> {
        let query = signed_query(params, timestamp_ms);
        let signature = sign(&self.api_secret, &query)?;

        let mut url = self.endpoint(path)?;
        url.set_query(Some(&format!("{}&signature={}", query, signature)));
        let response = self
            .http
            .request(method, url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        Self::check(response).await
    }

    async fn send_keyed(
        &self,
        method: Method,
        query: &[(&str, &str)],
    ) -> Result<Response, ArbError> {
        let url = self.endpoint(USER_DATA_STREAM_PATH)?;
        let response = self
            .http
            .request(method, url)
            .header(API_KEY_HEADER, &self.api_key)
            .query(query)
            .send()
            .await?;
        Self::check(response).await
    }
}

#[async_trait]
impl ExchangeApi for BinanceClient {
    fn name(&self) -> &str {
        "binance"
    }

    async fn exchange_info(&self) -> Result<ExchangeInfo, ArbError> {
        self.get_public(EXCHANGE_INFO_PATH, &[]).await
    }

    async fn all_tickers(&self) -> Result<TickersMap, ArbError> {
        let raw: Vec<RawBookTicker> = self.get_public(BOOK_TICKER_PATH, &[]).await?;
        let mut tickers = TickersMap::with_capacity(raw.len());
        for t in raw {
            tickers.insert(
                t.symbol.clone(),
                Ticker {
                    bid_price: parse_f64(&t.bid_price)?,
                    bid_qty: parse_f64(&t.bid_qty)?,
                    ask_price: parse_f64(&t.ask_price)?,
                    ask_qty: parse_f64(&t.ask_qty)?,
                    symbol: t.symbol,
                },
            );
        }
        Ok(tickers)
    }

    async fn depth(&self, symbol: &str, limit: u32) -> Result<Depth, ArbError> {
        let raw: RawDepth = self
            .get_public(
                DEPTH_PATH,
                &[("symbol", symbol.to_string()), ("limit", limit.to_string())],
            )
            .await?;
        Ok(Depth {
            bids: parse_levels(raw.bids)?,
            asks: parse_levels(raw.asks)?,
            last_update_id: raw.last_update_id,
        })
    }

    async fn account(&self) -> Result<Account, ArbError> {
        let response = self
            .send_signed(Method::GET, ACCOUNT_PATH, &[], unix_millis())
            .await?;
        let raw: RawAccount = response.json().await?;
        let balances = raw
            .balances
            .into_iter()
            .map(|b| {
                Ok(Balance {
                    coin: Coin::new(b.asset),
                    free: parse_f64(&b.free)?,
                    locked: parse_f64(&b.locked)?,
                })
            })
            .collect::<Result<Vec<_>, ArbError>>()?;
        let updated_at = if raw.update_time > 0 { raw.update_time } else { unix_millis() };
        Ok(Account::from_balances(balances, updated_at))
    }

    async fn new_order(
        &self,
        order: &OrderRequest,
        client_order_id: &str,
        timestamp_ms: i64,
        test_mode: bool,
    ) -> Result<OrderAck, ArbError> {
        let mut params = vec![
            ("symbol", order.symbol.clone()),
            ("side", order.side.as_str().to_string()),
            ("type", order.order_type.as_str().to_string()),
            ("quantity", format_decimal(order.qty)),
            ("newClientOrderId", client_order_id.to_string()),
            ("newOrderRespType", "FULL".to_string()),
        ];
        if order.order_type == OrderType::Limit {
            params.push(("timeInForce", TimeInForce::Ioc.as_str().to_string()));
            params.push(("price", format_decimal(order.price)));
        }

        let path = if test_mode { ORDER_TEST_PATH } else { ORDER_PATH };
        debug!("POST {} {} ({})", path, order, client_order_id);
        let response = self
            .send_signed(Method::POST, path, &params, timestamp_ms)
            .await
            .map_err(|e| match e {
                ArbError::ExchangeError(msg) => ArbError::ExecutionError(msg),
                other => other,
            })?;

        if test_mode {
            // The validation endpoint answers `{}`; report the order as accepted, nothing filled
            return Ok(OrderAck {
                symbol: order.symbol.clone(),
                order_id: 0,
                client_order_id: client_order_id.to_string(),
                status: OrderStatus::New,
                price: order.price,
                orig_qty: order.qty,
                executed_qty: 0.0,
                cumulative_quote_qty: 0.0,
                time_in_force: TimeInForce::Ioc,
                transact_time: timestamp_ms,
                fills: Vec::new(),
            });
        }
        let raw: RawOrderResponse = response.json().await?;
        raw.into_ack()
    }

    async fn start_user_stream(&self) -> Result<String, ArbError> {
        let response = self.send_keyed(Method::POST, &[]).await?;
        let body: ListenKeyResponse = response.json().await?;
        Ok(body.listen_key)
    }

    async fn keepalive_user_stream(&self, listen_key: &str) -> Result<(), ArbError> {
        self.send_keyed(Method::PUT, &[("listenKey", listen_key)])
            .await
            .map(|_| ())
    }

    async fn close_user_stream(&self, listen_key: &str) -> Result<(), ArbError> {
        if let Err(e) = self
            .send_keyed(Method::DELETE, &[("listenKey", listen_key)])
            .await
        {
            warn!("Failed to close user data stream: {}", e);
            return Err(e);
        }
        Ok(())
    }

    fn user_stream_url(&self, listen_key: &str) -> String {
        format!("{}/{}", self.ws_url, listen_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_matches_reference_vector() {
        // Example from the Binance API documentation
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        assert_eq!(
            sign(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_signed_query_ends_with_window_and_timestamp() {
        let params = [("symbol", "ETHBTC".to_string()), ("side", "BUY".to_string())];
        assert_eq!(
            signed_query(&params, 1499827319559),
            "symbol=ETHBTC&side=BUY&recvWindow=5000&timestamp=1499827319559"
        );
    }

    fn assert_send<T: Send>(_: T) {}

    #[test]
    fn test_signed_requests_are_send() {
        let client = BinanceClient::new(
            "https://api.binance.com",
            "wss://stream.binance.com:9443/ws",
            "key",
            "secret",
        )
        .unwrap();
        let order = OrderRequest {
            symbol: "ETHBTC".to_string(),
            side: crate::market::OrderSide::Buy,
            order_type: OrderType::Limit,
            qty: 1.0,
            price: 0.05,
        };
        // Built but never polled
        assert_send(client.account());
        assert_send(client.new_order(&order, "ETHBTC_1", 1, true));
        assert_send(client.send_signed(Method::GET, ACCOUNT_PATH, &[], 1));
    }

    #[test]
    fn test_format_decimal() {
        assert_eq!(format_decimal(1.234), "1.234");
        assert_eq!(format_decimal(2.0), "2");
        assert_eq!(format_decimal(0.000000011), "0.00000001");
        assert_eq!(format_decimal(0.0), "0");
    }

    #[test]
    fn test_order_response_parsing() {
        let raw = r#"{
            "symbol": "BTCUSDT", "orderId": 28, "orderListId": -1,
            "clientOrderId": "BTCUSDT_1", "transactTime": 1507725176595,
            "price": "0.00000000", "origQty": "10.00000000", "executedQty": "10.00000000",
            "cummulativeQuoteQty": "10.00000000", "status": "FILLED", "timeInForce": "IOC",
            "type": "LIMIT", "side": "SELL",
            "fills": [{"price": "4000.00000000", "qty": "1.00000000", "commission": "4.00000000", "commissionAsset": "USDT"}]
        }"#;
        let ack = serde_json::from_str::<RawOrderResponse>(raw).unwrap().into_ack().unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.fills.len(), 1);
        assert_eq!(ack.fills[0].commission_asset, "USDT");
        assert_eq!(ack.executed_qty, 10.0);
    }
}
