use std::convert::Infallible;
use std::net::SocketAddr;

use futures::Future;
use validator::Validate;
use warp::{http::StatusCode, Filter, Rejection, Reply};

use crate::global::{Global, SessionRequest, StartError};
use crate::models::MappingRecord;

mod message;
use message::*;

/// Bind the HTTP API and return the server future.
pub async fn bind(global: Global) -> Result<impl Future<Output = ()>, std::io::Error> {
    let port = global.config().server.port;

    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["content-type"])
        .allow_methods(vec!["GET", "POST", "OPTIONS"]);

    let api = routes(global)
        .with(cors)
        .with(warp::filters::log::log("ledmap::web"));

    let address = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(address = %address, "HTTP API listening");

    Ok(warp::serve(api)
        .run_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener)))
}

fn routes(global: Global) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let health = warp::path::end()
        .and(warp::get())
        .and(with_global(global.clone()))
        .and_then(health);

    let status = warp::path("status")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_global(global.clone()))
        .and_then(status);

    let device_connect = warp::path!("device" / "connect")
        .and(warp::post())
        .and(json_body())
        .and(with_global(global.clone()))
        .and_then(device_connect);

    let device_power = warp::path!("device" / "power")
        .and(warp::post())
        .and(json_body())
        .and(with_global(global.clone()))
        .and_then(device_power);

    let device_set = warp::path!("device" / "set")
        .and(warp::post())
        .and(json_body())
        .and(with_global(global.clone()))
        .and_then(device_set);

    let device_blink = warp::path!("device" / "blink")
        .and(warp::post())
        .and(json_body())
        .and(with_global(global.clone()))
        .and_then(device_blink);

    let draw_led = warp::path!("draw" / "led")
        .and(warp::post())
        .and(json_body())
        .and(with_global(global.clone()))
        .and_then(draw_led);

    let draw_batch = warp::path!("draw" / "led" / "batch")
        .and(warp::post())
        .and(json_body())
        .and(with_global(global.clone()))
        .and_then(draw_batch);

    let start_mapping = warp::path("start_mapping")
        .and(warp::path::end())
        .and(warp::post())
        .and(json_body())
        .and(with_global(global.clone()))
        .and_then(start_mapping);

    let resume_mapping = warp::path("resume_mapping")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::query::<ResumeQuery>())
        .and(with_global(global.clone()))
        .and_then(resume_mapping);

    let load_mapping = warp::path("load_mapping")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_global(global))
        .and_then(load_mapping);

    health
        .or(status)
        .or(device_connect)
        .or(device_power)
        .or(device_set)
        .or(device_blink)
        .or(draw_batch)
        .or(draw_led)
        .or(start_mapping)
        .or(resume_mapping)
        .or(load_mapping)
}

fn with_global(global: Global) -> impl Filter<Extract = (Global,), Error = Infallible> + Clone {
    warp::any().map(move || global.clone())
}

fn json_body<T: serde::de::DeserializeOwned + Send>(
) -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(64 * 1024).and(warp::body::json())
}

fn reply<T: serde::Serialize>(
    status: StatusCode,
    body: &T,
) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(body), status)
}

fn error_body(message: impl std::fmt::Display) -> serde_json::Value {
    serde_json::json!({ "ok": false, "error": message.to_string() })
}

async fn health(global: Global) -> Result<impl Reply, Infallible> {
    let connected = global.serial().is_open().await;

    Ok(warp::reply::json(&serde_json::json!({
        "status": "LED mapper backend running",
        "serialConnected": connected,
    })))
}

async fn status(global: Global) -> Result<impl Reply, Infallible> {
    let response = StatusResponse::from(global.sessions().snapshot());
    Ok(warp::reply::json(&response))
}

async fn device_connect(request: ConnectRequest, global: Global) -> Result<impl Reply, Infallible> {
    match global.serial().connect(request.port, request.baud).await {
        Ok((port, baud)) => Ok(reply(
            StatusCode::OK,
            &serde_json::json!({ "ok": true, "port": port, "baud": baud }),
        )),
        Err(error) => Ok(reply(StatusCode::BAD_REQUEST, &error_body(error))),
    }
}

async fn device_power(request: PowerRequest, global: Global) -> Result<impl Reply, Infallible> {
    let serial = global.serial();

    let result = if request.on {
        // Moderate white keeps the total power draw reasonable
        match serial.set_brightness(100).await {
            Ok(()) => serial.set_all(100, 100, 100).await,
            Err(error) => Err(error),
        }
    } else {
        serial.clear().await
    };

    match result {
        Ok(()) => Ok(reply(StatusCode::OK, &serde_json::json!({ "ok": true }))),
        Err(error) => Ok(reply(StatusCode::INTERNAL_SERVER_ERROR, &error_body(error))),
    }
}

async fn device_set(request: SetRequest, global: Global) -> Result<impl Reply, Infallible> {
    let level = (request.b.clamp(0., 1.) * 255.) as u8;

    match global.serial().set_pixel_fast(request.i, 0, level, 0).await {
        Ok(()) => Ok(reply(StatusCode::OK, &serde_json::json!({ "ok": true }))),
        Err(error) => Ok(reply(StatusCode::INTERNAL_SERVER_ERROR, &error_body(error))),
    }
}

async fn device_blink(request: BlinkRequest, global: Global) -> Result<impl Reply, Infallible> {
    match global.serial().blink(request.index).await {
        Ok(()) => Ok(reply(StatusCode::OK, &serde_json::json!({ "ok": true }))),
        Err(error) => Ok(reply(StatusCode::INTERNAL_SERVER_ERROR, &error_body(error))),
    }
}

async fn draw_led(request: PixelRequest, global: Global) -> Result<impl Reply, Infallible> {
    match global
        .serial()
        .set_pixel_fast(request.index, request.r, request.g, request.b)
        .await
    {
        Ok(()) => Ok(reply(StatusCode::OK, &serde_json::json!({ "ok": true }))),
        Err(error) => Ok(reply(StatusCode::INTERNAL_SERVER_ERROR, &error_body(error))),
    }
}

async fn draw_batch(request: BatchRequest, global: Global) -> Result<impl Reply, Infallible> {
    match global.serial().set_pixels_batch(&request.pixels).await {
        Ok(()) => Ok(reply(
            StatusCode::OK,
            &serde_json::json!({ "ok": true, "count": request.pixels.len() }),
        )),
        Err(error) => Ok(reply(StatusCode::INTERNAL_SERVER_ERROR, &error_body(error))),
    }
}

async fn start_mapping(
    request: StartMappingRequest,
    global: Global,
) -> Result<impl Reply, Infallible> {
    if let Err(errors) = request.validate() {
        return Ok(reply(StatusCode::BAD_REQUEST, &error_body(errors)));
    }

    let result = global
        .start_session(SessionRequest {
            roi: request.roi,
            brightness: request.brightness,
            led_count: request.num_leds,
            resume_from: request.resume_from_led,
        })
        .await;

    Ok(session_start_reply(result, "mapping started"))
}

async fn resume_mapping(query: ResumeQuery, global: Global) -> Result<impl Reply, Infallible> {
    let brightness = query.brightness.unwrap_or(0.5);
    let result = global.resume_session(query.resume_from, brightness).await;

    Ok(session_start_reply(result, "mapping resumed"))
}

fn session_start_reply(
    result: Result<(), StartError>,
    message: &str,
) -> warp::reply::WithStatus<warp::reply::Json> {
    match result {
        Ok(()) => reply(
            StatusCode::OK,
            &serde_json::json!({ "ok": true, "message": message }),
        ),
        Err(StartError::Conflict(error)) => reply(StatusCode::CONFLICT, &error_body(error)),
        Err(error @ StartError::NoPriorSession) => {
            reply(StatusCode::BAD_REQUEST, &error_body(error))
        }
        Err(error @ StartError::Serial(_)) => {
            reply(StatusCode::INTERNAL_SERVER_ERROR, &error_body(error))
        }
    }
}

async fn load_mapping(global: Global) -> Result<impl Reply, Infallible> {
    match MappingRecord::load(&global.config().mapping.output).await {
        Ok(record) => Ok(reply(StatusCode::OK, &record)),
        Err(error) => {
            debug!(error = %error, "no mapping to load");
            Ok(reply(
                StatusCode::NOT_FOUND,
                &error_body("no mapping file found"),
            ))
        }
    }
}
