//! `weather_forecast`: current conditions, daily forecast and history from
//! the Open-Meteo APIs.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{debug, info};

use crate::mcp::registry::{PropertySchema, Tool, ToolDescriptor, ToolError, ToolOutput};

pub const TOOL_NAME: &str = "weather_forecast";

const GEOCODING_URL: &str = "https://geocoding-api.open-meteo.com/v1/search";
const FORECAST_URL: &str = "https://api.open-meteo.com/v1/forecast";
const ARCHIVE_URL: &str = "https://archive-api.open-meteo.com/v1/archive";

const CURRENT_FIELDS: &str = "temperature_2m,relative_humidity_2m,apparent_temperature,precipitation,weather_code,wind_speed_10m,wind_direction_10m";
const DAILY_FIELDS: &str =
    "temperature_2m_max,temperature_2m_min,precipitation_sum,weather_code,wind_speed_10m_max";

const DEFAULT_FORECAST_DAYS: i64 = 7;
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMeteoEndpoints {
    pub geocoding: String,
    pub forecast: String,
    pub archive: String,
}

impl Default for OpenMeteoEndpoints {
    fn default() -> Self {
        Self {
            geocoding: GEOCODING_URL.to_string(),
            forecast: FORECAST_URL.to_string(),
            archive: ARCHIVE_URL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeocodingResponse {
    #[serde(default)]
    results: Vec<Place>,
}

#[derive(Debug, Clone, Deserialize)]
struct Place {
    name: String,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    country: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CurrentResponse {
    current: Option<CurrentWeather>,
    #[serde(default)]
    current_units: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct CurrentWeather {
    time: String,
    temperature_2m: Option<f64>,
    relative_humidity_2m: Option<f64>,
    apparent_temperature: Option<f64>,
    precipitation: Option<f64>,
    weather_code: Option<u32>,
    wind_speed_10m: Option<f64>,
    wind_direction_10m: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DailyResponse {
    daily: Option<Daily>,
    #[serde(default)]
    daily_units: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct Daily {
    time: Vec<String>,
    #[serde(default)]
    temperature_2m_max: Vec<Option<f64>>,
    #[serde(default)]
    temperature_2m_min: Vec<Option<f64>>,
    #[serde(default)]
    precipitation_sum: Vec<Option<f64>>,
    #[serde(default)]
    weather_code: Vec<Option<u32>>,
    #[serde(default)]
    wind_speed_10m_max: Vec<Option<f64>>,
}

struct OpenMeteoClient {
    http: reqwest::Client,
    endpoints: OpenMeteoEndpoints,
}

impl OpenMeteoClient {
    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ToolError> {
        let response = self
            .http
            .get(url)
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn geocode(&self, city: &str) -> Result<Option<Place>, ToolError> {
        debug!(city, "geocoding");
        let response: GeocodingResponse = self
            .get(
                &self.endpoints.geocoding,
                &[
                    ("name", city.to_string()),
                    ("count", "1".to_string()),
                    ("language", "en".to_string()),
                    ("format", "json".to_string()),
                ],
            )
            .await?;
        Ok(response.results.into_iter().next())
    }

    async fn current(&self, location: &Location) -> Result<CurrentResponse, ToolError> {
        let mut query = location.query();
        query.push(("current", CURRENT_FIELDS.to_string()));
        self.get(&self.endpoints.forecast, &query).await
    }

    async fn forecast(&self, location: &Location, days: i64) -> Result<DailyResponse, ToolError> {
        let mut query = location.query();
        query.push(("daily", DAILY_FIELDS.to_string()));
        query.push(("forecast_days", days.to_string()));
        self.get(&self.endpoints.forecast, &query).await
    }

    async fn history(
        &self,
        location: &Location,
        start: &str,
        end: &str,
    ) -> Result<DailyResponse, ToolError> {
        let mut query = location.query();
        query.push(("daily", DAILY_FIELDS.to_string()));
        query.push(("start_date", start.to_string()));
        query.push(("end_date", end.to_string()));
        self.get(&self.endpoints.archive, &query).await
    }
}

struct Location {
    latitude: f64,
    longitude: f64,
    label: String,
}

impl Location {
    fn query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("latitude", self.latitude.to_string()),
            ("longitude", self.longitude.to_string()),
            ("timezone", "auto".to_string()),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportKind {
    Current,
    Forecast,
    Historical,
    All,
}

impl ReportKind {
    fn parse(value: Option<&str>) -> Result<Self, String> {
        match value.unwrap_or("current") {
            "current" => Ok(ReportKind::Current),
            "forecast" => Ok(ReportKind::Forecast),
            "historical" => Ok(ReportKind::Historical),
            "all" => Ok(ReportKind::All),
            other => Err(format!(
                "Unknown type: {other}. Use 'current', 'forecast', 'historical', or 'all'"
            )),
        }
    }
}

pub struct WeatherTool {
    descriptor: ToolDescriptor,
    client: OpenMeteoClient,
}

impl WeatherTool {
    pub fn new() -> Result<Self, ToolError> {
        Self::with_endpoints(OpenMeteoEndpoints::default())
    }

    pub fn with_endpoints(endpoints: OpenMeteoEndpoints) -> Result<Self, ToolError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            descriptor: descriptor(),
            client: OpenMeteoClient { http, endpoints },
        })
    }

    async fn resolve_location(
        &self,
        arguments: &Map<String, Value>,
    ) -> Result<Result<Location, String>, ToolError> {
        if let Some(city) = arguments.get("city").and_then(Value::as_str) {
            return Ok(match self.client.geocode(city).await? {
                Some(place) => Ok(Location {
                    latitude: place.latitude,
                    longitude: place.longitude,
                    label: match place.country {
                        Some(country) => format!("{}, {country}", place.name),
                        None => place.name,
                    },
                }),
                None => Err(format!("Could not find location: {city}")),
            });
        }
        let latitude = arguments.get("latitude").and_then(Value::as_f64);
        let longitude = arguments.get("longitude").and_then(Value::as_f64);
        Ok(match (latitude, longitude) {
            (Some(latitude), Some(longitude)) => Ok(Location {
                latitude,
                longitude,
                label: format!("({latitude}, {longitude})"),
            }),
            _ => Err("Either 'city' or both 'latitude' and 'longitude' must be provided".to_string()),
        })
    }
}

fn descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        TOOL_NAME,
        "Get weather information: current conditions, a forecast of up to 16 days, or historical data. The location is a city name or latitude/longitude coordinates.",
    )
    .with_schema_description("Give either `city` or both `latitude` and `longitude`")
    .with_property(
        "city",
        PropertySchema::string()
            .with_description("City name for geocoding (e.g. 'Moscow', 'New York', 'Tokyo')"),
    )
    .with_property(
        "latitude",
        PropertySchema::new("number").with_description("Latitude coordinate (-90 to 90)"),
    )
    .with_property(
        "longitude",
        PropertySchema::new("number").with_description("Longitude coordinate (-180 to 180)"),
    )
    .with_property(
        "type",
        PropertySchema::string()
            .with_description("Type of weather data to retrieve")
            .with_enum(["current", "forecast", "historical", "all"])
            .with_default(json!("current")),
    )
    .with_property(
        "forecast_days",
        PropertySchema::integer().with_description("Number of forecast days (1-16, default: 7)"),
    )
    .with_property(
        "start_date",
        PropertySchema::string().with_description("Start date for historical data (YYYY-MM-DD)"),
    )
    .with_property(
        "end_date",
        PropertySchema::string().with_description("End date for historical data (YYYY-MM-DD)"),
    )
    .with_example(
        "What's the weather in Moscow right now?",
        json!({"city": "Moscow", "type": "current"}),
    )
    .with_example(
        "5-day forecast for Saint Petersburg",
        json!({"city": "Saint Petersburg", "type": "forecast", "forecast_days": 5}),
    )
    .with_example(
        "What was the weather in Tokyo from January 1 to 7, 2025?",
        json!({"city": "Tokyo", "type": "historical", "start_date": "2025-01-01", "end_date": "2025-01-07"}),
    )
    .with_negative_example("Why is the sky blue?", "general science question, not a weather lookup")
    .with_negative_example(
        "What should I wear to a wedding?",
        "fashion advice; call the tool only when the user asks about the weather at a place",
    )
}

#[async_trait]
impl Tool for WeatherTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, arguments: Map<String, Value>) -> Result<ToolOutput, ToolError> {
        info!(tool = TOOL_NAME, ?arguments, "fetching weather");
        let kind = match ReportKind::parse(arguments.get("type").and_then(Value::as_str)) {
            Ok(kind) => kind,
            Err(message) => return Ok(ToolOutput::failure(message)),
        };
        let days = arguments
            .get("forecast_days")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_FORECAST_DAYS)
            .clamp(1, 16);
        let start = arguments.get("start_date").and_then(Value::as_str);
        let end = arguments.get("end_date").and_then(Value::as_str);
        if kind == ReportKind::Historical && (start.is_none() || end.is_none()) {
            return Ok(ToolOutput::failure(
                "'start_date' and 'end_date' are required for historical data",
            ));
        }

        let location = match self.resolve_location(&arguments).await? {
            Ok(location) => location,
            Err(message) => return Ok(ToolOutput::failure(message)),
        };

        let mut report = String::new();
        let _ = writeln!(report, "Weather for {}", location.label);
        let _ = writeln!(report, "{}", "=".repeat(40));

        if matches!(kind, ReportKind::Current | ReportKind::All) {
            let current = self.client.current(&location).await?;
            write_current(&mut report, &current);
        }
        if matches!(kind, ReportKind::Forecast | ReportKind::All) {
            if kind == ReportKind::All {
                report.push('\n');
            }
            let forecast = self.client.forecast(&location, days).await?;
            let _ = writeln!(report, "{days}-Day Forecast:");
            write_daily(&mut report, &forecast, "Forecast");
        }
        if let (Some(start), Some(end)) = (start, end) {
            if matches!(kind, ReportKind::Historical | ReportKind::All) {
                if kind == ReportKind::All {
                    report.push('\n');
                }
                let history = self.client.history(&location, start, end).await?;
                let _ = writeln!(report, "Historical Weather ({start} to {end}):");
                write_daily(&mut report, &history, "Historical data");
            }
        }
        Ok(ToolOutput::text(report))
    }
}

fn unit<'a>(units: &'a Map<String, Value>, key: &str, fallback: &'a str) -> &'a str {
    units.get(key).and_then(Value::as_str).unwrap_or(fallback)
}

fn write_current(report: &mut String, response: &CurrentResponse) {
    let Some(current) = &response.current else {
        let _ = writeln!(report, "Current weather: unavailable");
        return;
    };
    let units = &response.current_units;
    let _ = writeln!(report, "Current Weather ({}):", current.time);
    let _ = writeln!(report, "{}", "-".repeat(30));
    if let Some(value) = current.temperature_2m {
        let _ = writeln!(report, "  Temperature: {value}{}", unit(units, "temperature_2m", "°C"));
    }
    if let Some(value) = current.apparent_temperature {
        let _ = writeln!(report, "  Feels like: {value}{}", unit(units, "temperature_2m", "°C"));
    }
    if let Some(value) = current.relative_humidity_2m {
        let _ = writeln!(report, "  Humidity: {value}{}", unit(units, "relative_humidity_2m", "%"));
    }
    if let Some(value) = current.precipitation {
        let _ = writeln!(report, "  Precipitation: {value}{}", unit(units, "precipitation", "mm"));
    }
    if let Some(value) = current.wind_speed_10m {
        let direction = current
            .wind_direction_10m
            .map(|degrees| format!(" ({})", compass_point(degrees)))
            .unwrap_or_default();
        let _ = writeln!(
            report,
            "  Wind: {value}{}{direction}",
            unit(units, "wind_speed_10m", "km/h")
        );
    }
    if let Some(code) = current.weather_code {
        let _ = writeln!(report, "  Conditions: {}", describe_weather_code(code));
    }
}

fn write_daily(report: &mut String, response: &DailyResponse, label: &str) {
    let Some(daily) = &response.daily else {
        let _ = writeln!(report, "{label}: unavailable");
        return;
    };
    let units = &response.daily_units;
    let _ = writeln!(report, "{}", "-".repeat(30));
    for (index, date) in daily.time.iter().enumerate() {
        let at = |values: &Vec<Option<f64>>| values.get(index).copied().flatten();
        let _ = writeln!(report, "  {date}:");
        if let (Some(min), Some(max)) = (at(&daily.temperature_2m_min), at(&daily.temperature_2m_max)) {
            let _ = writeln!(
                report,
                "    Temp: {min} - {max}{}",
                unit(units, "temperature_2m_max", "°C")
            );
        }
        if let Some(value) = at(&daily.precipitation_sum) {
            let _ = writeln!(
                report,
                "    Precipitation: {value}{}",
                unit(units, "precipitation_sum", "mm")
            );
        }
        if let Some(value) = at(&daily.wind_speed_10m_max) {
            let _ = writeln!(
                report,
                "    Max wind: {value}{}",
                unit(units, "wind_speed_10m_max", "km/h")
            );
        }
        if let Some(code) = daily.weather_code.get(index).copied().flatten() {
            let _ = writeln!(report, "    Conditions: {}", describe_weather_code(code));
        }
    }
}

/// WMO weather interpretation codes.
pub fn describe_weather_code(code: u32) -> &'static str {
    match code {
        0 => "Clear sky",
        1..=3 => "Partly cloudy",
        45 | 48 => "Foggy",
        51 | 53 | 55 => "Drizzle",
        56 | 57 => "Freezing drizzle",
        61 | 63 | 65 => "Rain",
        66 | 67 => "Freezing rain",
        71 | 73 | 75 => "Snowfall",
        77 => "Snow grains",
        80..=82 => "Rain showers",
        85 | 86 => "Snow showers",
        95 => "Thunderstorm",
        96 | 99 => "Thunderstorm with hail",
        _ => "Unknown",
    }
}

fn compass_point(degrees: f64) -> &'static str {
    const POINTS: [&str; 8] = ["N", "NE", "E", "SE", "S", "SW", "W", "NW"];
    let sector = ((degrees.rem_euclid(360.0) + 22.5) / 45.0) as usize % 8;
    POINTS[sector]
}
