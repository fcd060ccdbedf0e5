//! AKShare upstream adapter
//!
//! Talks to an AKTools-style HTTP bridge (an AKShare instance exposed over
//! REST). Responses arrive as JSON arrays of row objects with Chinese column
//! names; everything is normalized into the crate's closed record types
//! before it leaves this module.

use crate::calendar::{CalendarSource, RuleBasedSource};
use crate::error::{QdbError, Result, UpstreamErrorKind};
use crate::fetch::{AssetInfoPatch, UpstreamFetcher};
use crate::types::{AdjustMode, AssetSummary, Bar, IndexSummary, Market, Period, Quote};
use chrono::NaiveDate;
use reqwest::blocking::Client;
use serde_json::Value;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080/api/public";

/// Fetcher backed by an AKShare HTTP bridge.
pub struct AkshareFetcher {
    client: Client,
    base_url: String,
}

impl AkshareFetcher {
    /// Adapter against the default local bridge address.
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("quantdb/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| QdbError::upstream(UpstreamErrorKind::Network, e.to_string()))?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string() })
    }

    /// GET one interface and return the JSON row array.
    fn get_rows(&self, interface: &str, query: &[(&str, String)]) -> Result<Vec<Value>> {
        let url = format!("{}/{}", self.base_url, interface);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let kind = match status.as_u16() {
                429 => UpstreamErrorKind::RateLimited,
                404 => UpstreamErrorKind::NotFound,
                401 | 403 => UpstreamErrorKind::Auth,
                _ => UpstreamErrorKind::Network,
            };
            return Err(QdbError::upstream(kind, format!("{interface} returned {status}")));
        }

        let body: Value = response
            .json()
            .map_err(|e| QdbError::upstream(UpstreamErrorKind::SchemaChanged, e.to_string()))?;
        match body {
            Value::Array(rows) => Ok(rows),
            other => Err(QdbError::upstream(
                UpstreamErrorKind::SchemaChanged,
                format!("{interface}: expected a row array, got {other}"),
            )),
        }
    }

    fn bars_from_rows(interface: &str, rows: Vec<Value>) -> Result<Vec<Bar>> {
        let mut bars = Vec::with_capacity(rows.len());
        for row in rows {
            let date = row_day(&row, "日期").ok_or_else(|| {
                QdbError::upstream(
                    UpstreamErrorKind::SchemaChanged,
                    format!("{interface}: row without 日期 column"),
                )
            })?;
            bars.push(Bar {
                trade_date: date,
                open: row_f64(&row, "开盘"),
                high: row_f64(&row, "最高"),
                low: row_f64(&row, "最低"),
                close: row_f64(&row, "收盘"),
                volume: row_f64(&row, "成交量"),
                turnover: row_f64(&row, "成交额"),
                amplitude: row_f64(&row, "振幅"),
                pct_change: row_f64(&row, "涨跌幅"),
                change: row_f64(&row, "涨跌额"),
                turnover_rate: row_f64(&row, "换手率"),
                adjusted_close: None,
            });
        }
        bars.sort_by_key(|b| b.trade_date);
        Ok(bars)
    }

    fn quote_from_spot_row(symbol: &str, row: &Value) -> Quote {
        Quote {
            symbol: symbol.to_string(),
            price: row_f64(row, "最新价"),
            open: row_f64(row, "今开"),
            high: row_f64(row, "最高"),
            low: row_f64(row, "最低"),
            prev_close: row_f64(row, "昨收"),
            volume: row_f64(row, "成交量"),
            turnover: row_f64(row, "成交额"),
            pct_change: row_f64(row, "涨跌幅"),
            timestamp: None,
        }
    }

    fn spot_interface(market: Market) -> &'static str {
        match market {
            Market::CnA => "stock_zh_a_spot_em",
            Market::Hk => "stock_hk_spot_em",
        }
    }
}

impl UpstreamFetcher for AkshareFetcher {
    fn source_name(&self) -> &'static str {
        "akshare"
    }

    fn fetch_bars(
        &self,
        symbol: &str,
        market: Market,
        start: NaiveDate,
        end: NaiveDate,
        adjust: AdjustMode,
    ) -> Result<Vec<Bar>> {
        let interface = match market {
            Market::CnA => "stock_zh_a_hist",
            Market::Hk => "stock_hk_hist",
        };
        let adjust_param = match adjust {
            AdjustMode::Raw => "",
            AdjustMode::Qfq => "qfq",
            AdjustMode::Hfq => "hfq",
        };
        let rows = self.get_rows(
            interface,
            &[
                ("symbol", symbol.to_string()),
                ("period", "daily".to_string()),
                ("start_date", crate::types::format_day(start)),
                ("end_date", crate::types::format_day(end)),
                ("adjust", adjust_param.to_string()),
            ],
        )?;
        Self::bars_from_rows(interface, rows)
    }

    fn fetch_asset_info(&self, symbol: &str, market: Market) -> Result<AssetInfoPatch> {
        if market == Market::Hk {
            // The bridge has no per-symbol descriptive endpoint for Hong
            // Kong; the listing row carries the name.
            let rows = self.get_rows(Self::spot_interface(market), &[])?;
            let row = rows
                .iter()
                .find(|r| row_str(r, "代码").as_deref() == Some(symbol))
                .ok_or_else(|| QdbError::upstream(UpstreamErrorKind::NotFound, symbol))?;
            return Ok(AssetInfoPatch { name: row_str(row, "名称"), ..Default::default() });
        }

        // stock_individual_info_em answers as item/value pairs.
        let rows = self.get_rows(
            "stock_individual_info_em",
            &[("symbol", symbol.to_string())],
        )?;
        let mut patch = AssetInfoPatch::default();
        for row in &rows {
            let item = row_str(row, "item").unwrap_or_default();
            let value = row.get("value");
            match item.as_str() {
                "股票简称" => patch.name = value.and_then(value_str),
                "行业" => patch.industry = value.and_then(value_str),
                "上市时间" => {
                    patch.listing_date = value.and_then(value_str).and_then(|s| parse_loose_day(&s))
                }
                "总股本" => patch.total_shares = value.and_then(value_f64),
                _ => {}
            }
        }
        if patch.name.is_none() {
            return Err(QdbError::upstream(
                UpstreamErrorKind::SchemaChanged,
                "stock_individual_info_em: no 股票简称 item",
            ));
        }
        Ok(patch)
    }

    fn fetch_quote(&self, symbol: &str, market: Market) -> Result<Quote> {
        let rows = self.get_rows(Self::spot_interface(market), &[])?;
        let row = rows
            .iter()
            .find(|r| row_str(r, "代码").as_deref() == Some(symbol))
            .ok_or_else(|| QdbError::upstream(UpstreamErrorKind::NotFound, symbol))?;
        Ok(Self::quote_from_spot_row(symbol, row))
    }

    fn fetch_stock_list(&self, market: Option<Market>) -> Result<Vec<AssetSummary>> {
        let markets = match market {
            Some(m) => vec![m],
            None => vec![Market::CnA, Market::Hk],
        };
        let mut out = Vec::new();
        for m in markets {
            let rows = self.get_rows(Self::spot_interface(m), &[])?;
            for row in &rows {
                let (Some(symbol), Some(name)) = (row_str(row, "代码"), row_str(row, "名称"))
                else {
                    continue;
                };
                out.push(AssetSummary {
                    symbol,
                    name,
                    market: m,
                    latest_price: row_f64(row, "最新价"),
                });
            }
        }
        Ok(out)
    }

    fn fetch_index_series(
        &self,
        index_symbol: &str,
        period: Period,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>> {
        let rows = self.get_rows(
            "index_zh_a_hist",
            &[
                ("symbol", index_symbol.to_string()),
                ("period", period.as_str().to_string()),
                ("start_date", crate::types::format_day(start)),
                ("end_date", crate::types::format_day(end)),
            ],
        )?;
        Self::bars_from_rows("index_zh_a_hist", rows)
    }

    fn fetch_index_quote(&self, index_symbol: &str) -> Result<Quote> {
        let rows = self.get_rows("stock_zh_index_spot_em", &[])?;
        let row = rows
            .iter()
            .find(|r| {
                row_str(r, "代码")
                    .map(|code| code == index_symbol || code.ends_with(index_symbol))
                    .unwrap_or(false)
            })
            .ok_or_else(|| QdbError::upstream(UpstreamErrorKind::NotFound, index_symbol))?;
        Ok(Self::quote_from_spot_row(index_symbol, row))
    }

    fn fetch_index_list(&self, category: Option<&str>) -> Result<Vec<IndexSummary>> {
        let mut query = Vec::new();
        if let Some(category) = category {
            query.push(("symbol", category.to_string()));
        }
        let rows = self.get_rows("stock_zh_index_spot_em", &query)?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(IndexSummary {
                    symbol: row_str(row, "代码")?,
                    name: row_str(row, "名称")?,
                    category: category.map(str::to_string),
                    latest_price: row_f64(row, "最新价"),
                })
            })
            .collect())
    }

    fn fetch_financial_summary(&self, symbol: &str) -> Result<Value> {
        let rows = self.get_rows(
            "stock_financial_abstract",
            &[("symbol", symbol.to_string())],
        )?;
        Ok(Value::Array(rows))
    }

    fn fetch_trade_dates(&self, market: Market, start: NaiveDate, end: NaiveDate)
        -> Result<Vec<NaiveDate>> {
        match market {
            Market::CnA => {
                let rows = self.get_rows("tool_trade_date_hist_sina", &[])?;
                let mut days: Vec<NaiveDate> = rows
                    .iter()
                    .filter_map(|row| row_day(row, "trade_date"))
                    .filter(|d| *d >= start && *d <= end)
                    .collect();
                days.sort();
                Ok(days)
            }
            // The bridge publishes no Hong Kong trade-date feed; the
            // built-in closure rules answer for that market.
            Market::Hk => RuleBasedSource.trading_days(market, start, end),
        }
    }
}

fn classify_transport(e: reqwest::Error) -> QdbError {
    let kind = if e.is_timeout() || e.is_connect() || e.is_request() {
        UpstreamErrorKind::Network
    } else {
        UpstreamErrorKind::SchemaChanged
    };
    QdbError::upstream(kind, e.to_string())
}

fn row_str(row: &Value, key: &str) -> Option<String> {
    row.get(key).and_then(value_str)
}

fn value_str(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numeric cell, tolerating numbers serialized as strings and the "-"
/// placeholder the provider uses for absent values.
fn row_f64(row: &Value, key: &str) -> Option<f64> {
    row.get(key).and_then(value_f64)
}

fn value_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() || s == "-" {
                None
            } else {
                s.parse().ok()
            }
        }
        _ => None,
    }
}

fn row_day(row: &Value, key: &str) -> Option<NaiveDate> {
    row.get(key).and_then(value_str).and_then(|s| parse_loose_day(&s))
}

/// Dates arrive as `2024-01-02`, `20240102`, or a full timestamp.
fn parse_loose_day(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    let head = s.split(|c| c == 'T' || c == ' ').next().unwrap_or(s);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(head, "%Y%m%d"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bars_from_rows_normalizes_columns() {
        let rows = vec![
            json!({
                "日期": "2024-01-03",
                "开盘": 10.1, "收盘": "10.40", "最高": 10.5, "最低": 10.0,
                "成交量": 123456, "成交额": 1.2e8, "振幅": 4.9,
                "涨跌幅": 2.97, "涨跌额": 0.3, "换手率": "0.84"
            }),
            json!({
                "日期": "2024-01-02",
                "开盘": 10.0, "收盘": 10.1, "最高": 10.2, "最低": 9.9,
                "成交量": 99999, "成交额": 1.0e8, "振幅": "-",
                "涨跌幅": 1.0, "涨跌额": 0.1, "换手率": 0.7
            }),
        ];
        let bars = AkshareFetcher::bars_from_rows("stock_zh_a_hist", rows).unwrap();
        assert_eq!(bars.len(), 2);
        // Sorted ascending regardless of upstream order.
        assert_eq!(bars[0].trade_date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(bars[1].close, Some(10.4));
        assert_eq!(bars[1].turnover_rate, Some(0.84));
        assert_eq!(bars[0].amplitude, None);
    }

    #[test]
    fn test_missing_date_column_is_schema_change() {
        let rows = vec![json!({"开盘": 10.0})];
        let err = AkshareFetcher::bars_from_rows("stock_zh_a_hist", rows).unwrap_err();
        assert!(matches!(
            err,
            QdbError::Upstream { kind: UpstreamErrorKind::SchemaChanged, .. }
        ));
    }

    #[test]
    fn test_parse_loose_day_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 2);
        assert_eq!(parse_loose_day("2024-01-02"), expected);
        assert_eq!(parse_loose_day("20240102"), expected);
        assert_eq!(parse_loose_day("2024-01-02T00:00:00.000"), expected);
        assert_eq!(parse_loose_day("bogus"), None);
    }

    #[test]
    fn test_value_f64_tolerates_placeholders() {
        assert_eq!(value_f64(&json!("10.5")), Some(10.5));
        assert_eq!(value_f64(&json!(7)), Some(7.0));
        assert_eq!(value_f64(&json!("-")), None);
        assert_eq!(value_f64(&json!("")), None);
        assert_eq!(value_f64(&json!(null)), None);
    }
}
