use rust_decimal::Decimal;
use rust_decimal::Error as DecimalParseError;
use std::env;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use crate::grid::{GridBook, GridLevel};

#[derive(Debug)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub username: String,
    pub password: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug)]
pub enum ConfigError {
    ParseIntError(ParseIntError),
    DecimalParseError(DecimalParseError),
    CsvError(csv::Error),
    IoError(std::io::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::ParseIntError(e) => write!(f, "Parse int error: {}", e),
            ConfigError::DecimalParseError(e) => write!(f, "Decimal parse error: {}", e),
            ConfigError::CsvError(e) => write!(f, "CSV error: {}", e),
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ParseIntError> for ConfigError {
    fn from(err: ParseIntError) -> ConfigError {
        ConfigError::ParseIntError(err)
    }
}

impl From<rust_decimal::Error> for ConfigError {
    fn from(err: rust_decimal::Error) -> ConfigError {
        ConfigError::DecimalParseError(err)
    }
}

impl From<csv::Error> for ConfigError {
    fn from(err: csv::Error) -> ConfigError {
        ConfigError::CsvError(err)
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> ConfigError {
        ConfigError::IoError(err)
    }
}

/// Reads the grid definition.
///
/// Layout: the first row names the spot and future markets, the second row is
/// a header, every following row is
/// `open_at,close_at,open_chance,close_chance,place_qty`.
pub fn load_grid_file(path: &str) -> Result<GridBook, ConfigError> {
    let file = std::fs::File::open(path)?;
    parse_grid(file)
}

pub fn parse_grid<R: std::io::Read>(reader: R) -> Result<GridBook, ConfigError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut rows = reader.records();

    let names = rows
        .next()
        .ok_or_else(|| ConfigError::Invalid("grid file is empty".to_owned()))??;
    let spot = names.get(0).unwrap_or_default();
    let future = names.get(1).unwrap_or_default();
    if spot.is_empty() || future.is_empty() {
        return Err(ConfigError::Invalid(
            "first grid row must be `spot,future`".to_owned(),
        ));
    }

    // header
    rows.next()
        .ok_or_else(|| ConfigError::Invalid("grid file has no header row".to_owned()))??;

    let mut levels = Vec::new();
    for (i, row) in rows.enumerate() {
        let row = row?;
        if row.iter().all(|field| field.is_empty()) {
            continue;
        }
        if row.len() < 5 {
            return Err(ConfigError::Invalid(format!(
                "grid row {} has {} fields, expected 5",
                i + 3,
                row.len()
            )));
        }
        let open_at = Decimal::from_str(&row[0])?;
        let close_at = Decimal::from_str(&row[1])?;
        let open_chance = row[2].parse::<u32>()?;
        let close_chance = row[3].parse::<u32>()?;
        let place_qty = Decimal::from_str(&row[4])?;
        if place_qty <= Decimal::ZERO {
            return Err(ConfigError::Invalid(format!(
                "grid row {} has non-positive place_qty {}",
                i + 3,
                place_qty
            )));
        }
        levels.push(GridLevel::new(
            open_at,
            close_at,
            open_chance,
            close_chance,
            place_qty,
        ));
    }

    if levels.is_empty() {
        return Err(ConfigError::Invalid("grid file has no levels".to_owned()));
    }
    log::info!(
        "[CONFIG] grid loaded: spot={} future={} levels={}",
        spot,
        future,
        levels.len()
    );
    Ok(GridBook::new(spot, future, levels))
}

/// SMTP settings for alert mail. `None` when any variable is missing.
pub fn get_email_config_from_env() -> Option<EmailConfig> {
    let smtp_host = env::var("SMTP_HOST").ok().filter(|v| !v.is_empty())?;
    let username = env::var("SMTP_USERNAME").ok()?;
    let password = env::var("SMTP_PASSWORD").ok()?;
    let from = env::var("EMAIL_FROM").ok()?;
    let to = env::var("EMAIL_TO").ok()?;
    Some(EmailConfig {
        smtp_host,
        username,
        password,
        from,
        to,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    #[test]
    fn parses_names_header_and_levels() {
        let text = "BTC/USD,BTC-PERP\n\
                    openAt,closeAt,openChance,closeChance,placeQty\n\
                    0.010, 0.002, 1, 0, 5\n\
                    0.020,0.004,2,1,2.5\n";
        let book = parse_grid(text.as_bytes()).unwrap();
        assert_eq!(book.spot_market, "BTC/USD");
        assert_eq!(book.future_market, "BTC-PERP");
        assert_eq!(book.levels.len(), 2);
        assert_eq!(book.levels[0].open_at, dec("0.010"));
        assert_eq!(book.levels[0].close_chance, 0);
        assert_eq!(book.levels[1].open_chance, 2);
        assert_eq!(book.levels[1].place_qty, dec("2.5"));
        assert!(book.levels[0].open_pairs.is_empty());
        assert_ne!(book.levels[0].id, book.levels[1].id);
    }

    #[test]
    fn skips_blank_rows() {
        let text = "S,F\nh1,h2,h3,h4,h5\n\n0.01,0,1,1,1\n,,,,\n";
        let book = parse_grid(text.as_bytes()).unwrap();
        assert_eq!(book.levels.len(), 1);
    }

    #[test]
    fn rejects_malformed_numbers() {
        let text = "S,F\nheader\n0.01,0,x,1,1\n";
        assert!(matches!(
            parse_grid(text.as_bytes()),
            Err(ConfigError::ParseIntError(_))
        ));
        let text = "S,F\nheader\nabc,0,1,1,1\n";
        assert!(matches!(
            parse_grid(text.as_bytes()),
            Err(ConfigError::DecimalParseError(_))
        ));
    }

    #[test]
    fn rejects_short_rows_and_missing_levels() {
        assert!(matches!(
            parse_grid("S,F\nheader\n0.01,0,1\n".as_bytes()),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            parse_grid("S,F\nheader\n".as_bytes()),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            parse_grid("S\nheader\n0.01,0,1,1,1\n".as_bytes()),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            parse_grid("".as_bytes()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_non_positive_quantity() {
        let text = "S,F\nheader\n0.01,0,1,1,0\n";
        assert!(matches!(
            parse_grid(text.as_bytes()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn missing_grid_file_is_io_error() {
        assert!(matches!(
            load_grid_file("/nonexistent/grid.csv"),
            Err(ConfigError::IoError(_))
        ));
    }
}
