//! Request payloads for the remote archive.
//!
//! Each timestep has its own variant carrying only the fields valid for it,
//! so there is no conditional key insertion anywhere. Builders are pure:
//! identical inputs always produce identical payloads.

use serde::Serialize;

use crate::calendar;
use crate::stream::{OutputFormat, StreamDescriptor, Timestep};

/// Historical coverage of the monthly-means datasets, used when a bulk
/// request spans the whole record instead of a single month.
const LAND_MONTHLY_YEARS: (i32, i32) = (1981, 2018);
const SINGLE_LEVELS_MONTHLY_YEARS: (i32, i32) = (1979, 2019);

/// A request payload for the primary service or the legacy archive dialect.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Request {
    Hourly(HourlyRequest),
    Daily(DailyRequest),
    Monthly(MonthlyRequest),
    Legacy(MarsRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_type: Option<String>,
    pub variable: String,
    pub year: String,
    pub month: String,
    pub day: Vec<String>,
    pub time: Vec<String>,
    pub format: String,
    pub area: Vec<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pressure_level: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_type: Option<String>,
    pub variable: String,
    pub year: String,
    pub month: Vec<String>,
    pub day: Vec<String>,
    pub format: String,
    pub area: Vec<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pressure_level: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_type: Option<String>,
    pub variable: String,
    pub year: Vec<String>,
    pub month: Vec<String>,
    pub time: String,
    pub format: String,
    pub area: Vec<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pressure_level: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
}

/// Legacy archive-retrieval dialect used for the ERA5.1 historical band.
/// Keyed by grib parameter code, with a date-range string and a slash-joined
/// hourly time string instead of lists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarsRequest {
    pub param: String,
    pub date: String,
    pub levtype: String,
    pub stream: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub grid: String,
    pub time: String,
    pub format: String,
    pub area: Vec<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub levelist: Vec<String>,
}

/// Build a request for the primary service.
///
/// `back` produces one payload spanning the dataset's full coverage:
/// months expand to all twelve, and for the monthly-means datasets the year
/// expands to the fixed historical range regardless of the year passed in.
pub fn build_request(
    desc: &StreamDescriptor,
    year: i32,
    month: u32,
    cds_name: &str,
    day_list: &[String],
    format: OutputFormat,
    tstep: Timestep,
    back: bool,
) -> Request {
    match tstep {
        Timestep::Hour => Request::Hourly(HourlyRequest {
            product_type: desc.product_type.clone(),
            variable: cds_name.to_string(),
            year: year.to_string(),
            month: format!("{month:02}"),
            day: day_list.to_vec(),
            time: calendar::hour_list(),
            format: format.request_name().to_string(),
            area: desc.area.clone(),
            pressure_level: desc.levels.clone(),
            version: desc.version.clone(),
            dataset: desc.dataset.clone(),
        }),
        Timestep::Day => {
            // A bulk daily request covers every month; day 29..31 are simply
            // absent from the shorter months on the service side.
            let (months, days) = if back {
                (calendar::month_list(), calendar::all_days())
            } else {
                (vec![format!("{month:02}")], day_list.to_vec())
            };
            Request::Daily(DailyRequest {
                product_type: desc.product_type.clone(),
                variable: cds_name.to_string(),
                year: year.to_string(),
                month: months,
                day: days,
                format: format.request_name().to_string(),
                area: desc.area.clone(),
                pressure_level: desc.levels.clone(),
                version: desc.version.clone(),
                dataset: desc.dataset.clone(),
            })
        }
        Timestep::Month => {
            let (years, months) = if back {
                (bulk_years(&desc.dsid, year), calendar::month_list())
            } else {
                (vec![year.to_string()], vec![format!("{month:02}")])
            };
            Request::Monthly(MonthlyRequest {
                product_type: desc.product_type.clone(),
                variable: cds_name.to_string(),
                year: years,
                month: months,
                time: "00:00".to_string(),
                format: format.request_name().to_string(),
                area: desc.area.clone(),
                pressure_level: desc.levels.clone(),
                version: desc.version.clone(),
                dataset: desc.dataset.clone(),
            })
        }
    }
}

/// Build a request in the legacy archive dialect. Addressed by grib code
/// rather than service variable name.
pub fn build_mars_request(
    desc: &StreamDescriptor,
    year: i32,
    month: u32,
    param_code: &str,
    format: OutputFormat,
) -> Request {
    let last = calendar::days_in_month(year, month);
    let date = format!("{year}-{month:02}-01/to/{year}-{month:02}-{last:02}");
    let time = (0..24)
        .map(|h| format!("{h:02}:00:00"))
        .collect::<Vec<_>>()
        .join("/");

    Request::Legacy(MarsRequest {
        param: param_code.to_string(),
        date,
        levtype: "pl".to_string(),
        stream: "oper".to_string(),
        kind: "an".to_string(),
        grid: "0.25/0.25".to_string(),
        time,
        format: format.request_name().to_string(),
        area: desc.area.clone(),
        levelist: desc.levels.clone(),
    })
}

/// Year range for a bulk monthly request. Known monthly-means datasets have
/// fixed coverage; anything else falls back to the single year passed in.
fn bulk_years(dsid: &str, year: i32) -> Vec<String> {
    let (start, end) = match dsid {
        "reanalysis-era5-land-monthly-means" => LAND_MONTHLY_YEARS,
        "reanalysis-era5-single-levels-monthly-means" => SINGLE_LEVELS_MONTHLY_YEARS,
        _ => return vec![year.to_string()],
    };
    (start..=end).map(|y| y.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_desc() -> StreamDescriptor {
        serde_yaml::from_str(
            r#"
dsid: reanalysis-era5-single-levels
product_type: reanalysis
grid: "025"
area: [90.0, -180.0, -90.0, 180.0]
"#,
        )
        .unwrap()
    }

    fn pressure_desc() -> StreamDescriptor {
        serde_yaml::from_str(
            r#"
dsid: reanalysis-era5-pressure-levels
product_type: reanalysis
grid: "025"
area: [20.0, 78.0, -57.0, -140.0]
levels: ["850", "925", "1000"]
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_hourly_request_shape() {
        let days = calendar::day_list(2020, 3);
        let req = build_request(
            &surface_desc(),
            2020,
            3,
            "2m_temperature",
            &days,
            OutputFormat::Netcdf,
            Timestep::Hour,
            false,
        );
        match req {
            Request::Hourly(r) => {
                assert_eq!(r.year, "2020");
                assert_eq!(r.month, "03");
                assert_eq!(r.day.len(), 31);
                assert_eq!(r.time.len(), 24);
                assert!(r.pressure_level.is_empty());
            }
            other => panic!("expected hourly request, got {other:?}"),
        }
    }

    #[test]
    fn test_levels_only_when_declared() {
        let days = calendar::day_list(2020, 3);
        let req = build_request(
            &pressure_desc(),
            2020,
            3,
            "temperature",
            &days,
            OutputFormat::Netcdf,
            Timestep::Hour,
            false,
        );
        match req {
            Request::Hourly(r) => assert_eq!(r.pressure_level.len(), 3),
            other => panic!("expected hourly request, got {other:?}"),
        }

        // surface payload must not serialize an empty level list
        let surf = build_request(
            &surface_desc(),
            2020,
            3,
            "2m_temperature",
            &days,
            OutputFormat::Netcdf,
            Timestep::Hour,
            false,
        );
        let json = serde_json::to_string(&surf).unwrap();
        assert!(!json.contains("pressure_level"));
    }

    #[test]
    fn test_builder_is_pure() {
        let days = calendar::day_list(2019, 6);
        let a = build_request(
            &surface_desc(),
            2019,
            6,
            "total_precipitation",
            &days,
            OutputFormat::Netcdf,
            Timestep::Hour,
            false,
        );
        let b = build_request(
            &surface_desc(),
            2019,
            6,
            "total_precipitation",
            &days,
            OutputFormat::Netcdf,
            Timestep::Hour,
            false,
        );
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_monthly_bulk_expands_full_range() {
        let desc: StreamDescriptor = serde_yaml::from_str(
            r#"
dsid: reanalysis-era5-land-monthly-means
product_type: monthly_averaged_reanalysis
grid: "01"
area: [90.0, -180.0, -90.0, 180.0]
"#,
        )
        .unwrap();
        // the single year passed in must not matter
        let req = build_request(
            &desc,
            2005,
            7,
            "snow_cover",
            &[],
            OutputFormat::Netcdf,
            Timestep::Month,
            true,
        );
        match req {
            Request::Monthly(r) => {
                assert_eq!(r.year.first().unwrap(), "1981");
                assert_eq!(r.year.last().unwrap(), "2018");
                assert_eq!(r.month.len(), 12);
                assert_eq!(r.time, "00:00");
            }
            other => panic!("expected monthly request, got {other:?}"),
        }
    }

    #[test]
    fn test_monthly_single_month() {
        let req = build_request(
            &surface_desc(),
            2020,
            2,
            "2m_temperature",
            &[],
            OutputFormat::Netcdf,
            Timestep::Month,
            false,
        );
        match req {
            Request::Monthly(r) => {
                assert_eq!(r.year, vec!["2020"]);
                assert_eq!(r.month, vec!["02"]);
            }
            other => panic!("expected monthly request, got {other:?}"),
        }
    }

    #[test]
    fn test_mars_request_shape() {
        let req = build_mars_request(&pressure_desc(), 2003, 2, "130.128", OutputFormat::Netcdf);
        match req {
            Request::Legacy(r) => {
                assert_eq!(r.date, "2003-02-01/to/2003-02-28");
                assert_eq!(r.levtype, "pl");
                assert_eq!(r.stream, "oper");
                assert_eq!(r.kind, "an");
                assert!(r.time.starts_with("00:00:00/01:00:00/"));
                assert!(r.time.ends_with("/23:00:00"));
                assert_eq!(r.levelist.len(), 3);
                let json = serde_json::to_string(&r).unwrap();
                assert!(json.contains("\"type\":\"an\""));
            }
            other => panic!("expected legacy request, got {other:?}"),
        }
    }
}
