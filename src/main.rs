use actix_utils::future::{ready, Ready};
use actix_web::{
    dev, error,
    http::header::{ContentDisposition, ContentType, DispositionParam, DispositionType},
    middleware::{Compress, Logger},
    route,
    web::{self, Data},
    App, FromRequest, HttpRequest, HttpResponse, HttpServer, Result,
};
use chrono::Utc;
use dotenv::dotenv;
use std::time::Duration;
use toggl_ical::calendar::build_calendar;
use toggl_ical::entries::{lookback_range, EnrichedEntry, EntriesDocument, Timesheet};
use toggl_ical::toggl::{self, TogglClient};
use toggl_ical::AppConfig;

const CALENDAR_CONTENT_TYPE: &str = "text/calendar; charset=utf-8";

/// Shared state of all workers.
struct AppState {
    config: AppConfig,
    http: reqwest::Client,
}

/// Query parameters of every route. Missing or malformed values become empty strings.
#[derive(Default, Debug)]
struct FeedQuery {
    token: String,
    workspace: String,
}

impl FeedQuery {
    /// Parses each parameter on its own, keeping the first value of a repeated key.
    fn from_query(query: &str) -> FeedQuery {
        let pairs = web::Query::<Vec<(String, String)>>::from_query(query)
            .map(web::Query::into_inner)
            .unwrap_or_default();

        let param = |key: &str| {
            pairs
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.clone())
                .unwrap_or_default()
        };

        FeedQuery {
            token: param("token"),
            workspace: param("workspace"),
        }
    }
}

impl FromRequest for FeedQuery {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _pl: &mut dev::Payload) -> Self::Future {
        ready(Ok(FeedQuery::from_query(req.query_string())))
    }
}

/// Fetches the trailing window of time entries for the token's owner and resolves their projects.
async fn load_entries(query: &FeedQuery, state: &AppState) -> Result<Vec<EnrichedEntry>> {
    let toggl_config = &state.config.toggl;

    let result: toggl_ical::Result<Vec<EnrichedEntry>> = async {
        let client = TogglClient::new(state.http.clone(), &toggl_config.api_url, &query.token)?;
        let timesheet = Timesheet::new(client).with_project_errors(toggl_config.project_errors);
        let range = lookback_range(Utc::now(), toggl_config.lookback_months);

        timesheet.get_entries(range).await
    }
    .await;

    result.map_err(|err| {
        log::error!("failed to load time entries: {err}");
        error::ErrorInternalServerError("failed to load time entries")
    })
}

#[route("/index.json", method = "GET", method = "HEAD")]
async fn index_json(query: FeedQuery, state: Data<AppState>) -> Result<HttpResponse> {
    let entries = load_entries(&query, &state).await?;

    let body = EntriesDocument { entries: &entries }
        .to_json_pretty()
        .map_err(|err| {
            log::error!("{err}");
            error::ErrorInternalServerError("serialization error")
        })?;

    Ok(HttpResponse::Ok().content_type(ContentType::json()).body(body))
}

async fn calendar_feed(query: FeedQuery, state: Data<AppState>) -> Result<HttpResponse> {
    let entries = load_entries(&query, &state).await?;

    let calendar = build_calendar(&entries, &query.workspace, &state.config.calendar);

    Ok(HttpResponse::Ok()
        .content_type(CALENDAR_CONTENT_TYPE)
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename("calendar.ics".into())],
        })
        .body(calendar.to_string()))
}

/// Registers the JSON route; every other path serves the calendar feed.
fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(index_json)
        .default_service(web::to(calendar_feed));
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = AppConfig::load()?;
    let http = toggl::http_client(Duration::from_secs(config.toggl.timeout_secs))?;

    let listen_addr = config.server.listen_addr;
    let workers = config.server.workers;
    let state = Data::new(AppState { config, http });

    log::info!("starting HTTP server at {}", listen_addr);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(routes)
            .wrap(Compress::default())
            // Don't log things that could identify the user, e.g. omit client IP, referrer,
            // user agent and the query string carrying the token.
            .wrap(Logger::new(r#""%m %U" %s %b %T"#))
    })
    .workers(workers)
    .bind(listen_addr)?
    .run()
    .await?;

    Ok(())
}
