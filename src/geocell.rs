//! Geocell keys: base32 geohashes used to scope chat queries to a neighborhood.
//!
//! A key of precision `p` names a rectangular cell. Cells nest, so the key at
//! precision `p - 1` is always a prefix of the key at precision `p` for the
//! same coordinate. That lets a relay filter on a short prefix and still match
//! notes tagged with longer keys.

use thiserror::Error;

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Longest key produced; 12 characters is already sub-centimetre.
pub const MAX_PRECISION: usize = 12;

/// Reasons a coordinate or key cannot be turned into a cell.
#[derive(Debug, Error, PartialEq)]
pub enum GeocellError {
    #[error("precision must be between 1 and {MAX_PRECISION}, got {0}")]
    InvalidPrecision(usize),
    #[error("latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("invalid geocell character {0:?}")]
    InvalidCharacter(char),
    #[error("empty geocell key")]
    Empty,
}

/// Rectangle covered by a geocell key, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_lng: f64,
    pub min_lat: f64,
    pub max_lng: f64,
    pub max_lat: f64,
}

impl Bounds {
    /// Center of the cell as `(lng, lat)`.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lng + self.max_lng) / 2.0,
            (self.min_lat + self.max_lat) / 2.0,
        )
    }
}

/// Encode `(lng, lat)` into a key of `precision` characters.
///
/// Out-of-range or non-finite input is rejected, never clamped.
pub fn geocell_key(lng: f64, lat: f64, precision: usize) -> Result<String, GeocellError> {
    if precision == 0 || precision > MAX_PRECISION {
        return Err(GeocellError::InvalidPrecision(precision));
    }
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(GeocellError::LatitudeOutOfRange(lat));
    }
    if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
        return Err(GeocellError::LongitudeOutOfRange(lng));
    }

    let (mut lng_lo, mut lng_hi) = (-180.0_f64, 180.0_f64);
    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let mut key = String::with_capacity(precision);
    let mut idx = 0usize;
    let mut bits = 0u8;
    // Bits alternate longitude, latitude, starting with longitude.
    let mut even = true;
    while key.len() < precision {
        if even {
            let mid = (lng_lo + lng_hi) / 2.0;
            if lng >= mid {
                idx = idx * 2 + 1;
                lng_lo = mid;
            } else {
                idx *= 2;
                lng_hi = mid;
            }
        } else {
            let mid = (lat_lo + lat_hi) / 2.0;
            if lat >= mid {
                idx = idx * 2 + 1;
                lat_lo = mid;
            } else {
                idx *= 2;
                lat_hi = mid;
            }
        }
        even = !even;
        bits += 1;
        if bits == 5 {
            key.push(BASE32[idx] as char);
            bits = 0;
            idx = 0;
        }
    }
    Ok(key)
}

/// Decode a key into the rectangle it covers.
pub fn decode_bounds(key: &str) -> Result<Bounds, GeocellError> {
    if key.is_empty() {
        return Err(GeocellError::Empty);
    }
    let mut b = Bounds {
        min_lng: -180.0,
        min_lat: -90.0,
        max_lng: 180.0,
        max_lat: 90.0,
    };
    let mut even = true;
    for c in key.chars() {
        let lowered = c.to_ascii_lowercase();
        let idx = BASE32
            .iter()
            .position(|&b| b as char == lowered)
            .ok_or(GeocellError::InvalidCharacter(c))?;
        for n in (0..5).rev() {
            let bit = (idx >> n) & 1;
            if even {
                let mid = (b.min_lng + b.max_lng) / 2.0;
                if bit == 1 {
                    b.min_lng = mid;
                } else {
                    b.max_lng = mid;
                }
            } else {
                let mid = (b.min_lat + b.max_lat) / 2.0;
                if bit == 1 {
                    b.min_lat = mid;
                } else {
                    b.max_lat = mid;
                }
            }
            even = !even;
        }
    }
    Ok(b)
}

/// All prefixes of `key`, shortest first: `"u4p"` gives `["u", "u4", "u4p"]`.
pub fn prefixes(key: &str) -> Vec<&str> {
    key.char_indices()
        .map(|(i, c)| &key[..i + c.len_utf8()])
        .collect()
}

/// Truncate `key` to at most `len` characters, the coarser enclosing cell.
pub fn scope(key: &str, len: usize) -> &str {
    match key.char_indices().nth(len) {
        Some((i, _)) => &key[..i],
        None => key,
    }
}
