use std::sync::Arc;

use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::clock;
use crate::manager::StationManager;

const NOT_FOUND: &str = "Eva-Station not found\n";

/// All HTTP endpoints under `/bahn`, with permissive CORS.
pub fn routes(
    manager: Arc<StationManager>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let manager_filter = warp::any().map(move || manager.clone());

    // GET /bahn/list
    let list_route = warp::path!("bahn" / "list")
        .and(warp::get())
        .and(manager_filter.clone())
        .map(|manager: Arc<StationManager>| warp::reply::json(&manager.listing()));

    // GET /bahn/eva/{eva}
    let station_route = warp::path!("bahn" / "eva" / String)
        .and(warp::get())
        .and(manager_filter.clone())
        .map(|eva: String, manager: Arc<StationManager>| {
            match manager.station(eva.trim()) {
                Some(station) => warp::reply::json(&station.view(clock::berlin_now())).into_response(),
                None => not_found(),
            }
        });

    // GET /bahn/top
    let top_route = warp::path!("bahn" / "top")
        .and(warp::get())
        .and(manager_filter)
        .map(|manager: Arc<StationManager>| {
            warp::reply::json(&manager.global().view(clock::berlin_now()))
        });

    // Anything else below /bahn
    let fallback = warp::path("bahn").map(not_found);

    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "POST", "OPTIONS"])
        .allow_headers(vec!["Content-Type", "Authorization"]);

    list_route
        .or(station_route)
        .or(top_route)
        .or(fallback)
        .with(cors)
        .with(warp::trace::request())
}

fn not_found() -> Response {
    warp::reply::with_status(NOT_FOUND, StatusCode::NOT_FOUND).into_response()
}
