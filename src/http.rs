//! Read-only quote statistics endpoint. hyper v1.
//!
//! `GET /quote?ticker=PETR4&start_date=2025-07-29`

use chrono::{Days, Local, NaiveDate};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_LOOKBACK_DAYS;
use crate::db::QuoteStatsSource;
use crate::formats::reader::TRADE_DATE_FORMAT;

const QUOTE_PATH: &str = "/quote";

#[derive(Debug, Serialize)]
struct QuoteResponse<'a> {
    ticker: &'a str,
    max_range_value: f64,
    max_daily_volume: i64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
}

/// Accept connections on `listener` until `shutdown` resolves
pub async fn serve<S>(
    listener: TcpListener,
    source: Arc<dyn QuoteStatsSource>,
    shutdown: S,
) -> anyhow::Result<()>
where
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    if let Ok(addr) = listener.local_addr() {
        info!("Quote endpoint listening on http://{}{}", addr, QUOTE_PATH);
    }

    loop {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = &mut shutdown => {
                info!("Shutting down quote endpoint");
                return Ok(());
            }
        };
        debug!("Accepted connection from {}", peer);

        let io = TokioIo::new(socket);
        let source = Arc::clone(&source);
        let service = service_fn(move |req| {
            let source = Arc::clone(&source);
            async move { handle(source.as_ref(), req).await }
        });
        tokio::spawn(async move {
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                warn!("Error serving connection: {:?}", err);
            }
        });
    }
}

async fn handle(
    source: &dyn QuoteStatsSource,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let today = Local::now().date_naive();
    Ok(respond(source, req.method(), req.uri().path(), req.uri().query(), today).await)
}

/// Route and answer one request. `today` anchors the default start date.
async fn respond(
    source: &dyn QuoteStatsSource,
    method: &Method,
    path: &str,
    query: Option<&str>,
    today: NaiveDate,
) -> Response<Full<Bytes>> {
    if path != QUOTE_PATH {
        return error_response(StatusCode::NOT_FOUND, "not found");
    }
    if method != Method::GET {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "only GET is supported");
    }

    let mut ticker = None;
    let mut start_date = None;
    for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
        match key.as_ref() {
            "ticker" => ticker = Some(value.into_owned()),
            "start_date" | "data_inicio" => start_date = Some(value.into_owned()),
            _ => {}
        }
    }

    let ticker = match ticker.as_deref().map(str::trim) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => return error_response(StatusCode::BAD_REQUEST, "ticker is required"),
    };

    let start_date = match start_date.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => match NaiveDate::parse_from_str(raw, TRADE_DATE_FORMAT) {
            Ok(date) => date,
            Err(_) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "start_date must be formatted as YYYY-MM-DD",
                );
            }
        },
        None => today
            .checked_sub_days(Days::new(DEFAULT_LOOKBACK_DAYS as u64))
            .unwrap_or(today),
    };

    match source.quote_stats(&ticker, start_date).await {
        Ok(stats) => json_response(
            StatusCode::OK,
            &QuoteResponse {
                ticker: &ticker,
                max_range_value: stats.max_price,
                max_daily_volume: stats.max_daily_volume,
            },
        ),
        Err(e) => {
            error!("Quote query for {} failed: {}", ticker, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "query failed")
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &ErrorResponse { error: message })
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(body).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    response
}
