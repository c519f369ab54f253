//! Parsing of the speedtest.net configuration and server list documents.
//!
//! Both documents are flat XML where everything of interest lives in the
//! attributes of `<client .../>` and `<server .../>` elements, so they are
//! scanned with regular expressions instead of a full XML parser.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::ProviderError;

lazy_static! {
    static ref CLIENT_TAG: Regex = Regex::new(r"<client\s([^>]*)>").unwrap();
    static ref SERVER_TAG: Regex = Regex::new(r"<server\s([^>]*)>").unwrap();
    static ref ATTRIBUTE: Regex = Regex::new(r#"([A-Za-z_][\w.-]*)\s*=\s*"([^"]*)""#).unwrap();
}

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    /// Great-circle distance in kilometres (haversine)
    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lon = (other.lon - self.lon).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

/// Where speedtest.net thinks we are
#[derive(Debug, Clone, PartialEq)]
pub struct ClientInfo {
    pub ip: String,
    pub isp: String,
    pub location: Coordinates,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub country: String,
    pub sponsor: String,
    pub host: String,
    /// Upload endpoint, other test files live next to it
    pub url: String,
    pub location: Coordinates,
}

pub fn parse_client(document: &str) -> Result<ClientInfo, ProviderError> {
    let captures = CLIENT_TAG
        .captures(document)
        .ok_or_else(|| ProviderError::parse("missing <client> element"))?;
    let attrs = attributes(&captures[1]);

    Ok(ClientInfo {
        ip: attrs.get("ip").cloned().unwrap_or_default(),
        isp: attrs.get("isp").cloned().unwrap_or_default(),
        location: coordinates(&attrs, "client")?,
    })
}

/// Parses every `<server>` element; entries without a url or position are skipped.
pub fn parse_servers(document: &str) -> Result<Vec<Server>, ProviderError> {
    let servers: Vec<Server> = SERVER_TAG
        .captures_iter(document)
        .filter_map(|captures| {
            let attrs = attributes(&captures[1]);
            let url = attrs.get("url").filter(|u| !u.is_empty())?.clone();
            let location = coordinates(&attrs, "server").ok()?;
            let field = |key: &str| attrs.get(key).cloned().unwrap_or_default();

            Some(Server {
                id: field("id"),
                name: field("name"),
                country: field("country"),
                sponsor: field("sponsor"),
                host: field("host"),
                url,
                location,
            })
        })
        .collect();

    if servers.is_empty() {
        return Err(ProviderError::parse("server list contains no usable <server> element"));
    }

    Ok(servers)
}

/// The `count` servers nearest to `from`, nearest first
pub fn closest_servers(mut servers: Vec<Server>, from: &Coordinates, count: usize) -> Vec<Server> {
    servers.sort_by(|a, b| {
        from.distance_km(&a.location)
            .total_cmp(&from.distance_km(&b.location))
    });
    servers.truncate(count);
    servers
}

fn attributes(raw: &str) -> HashMap<String, String> {
    ATTRIBUTE
        .captures_iter(raw)
        .map(|c| (c[1].to_string(), unescape(&c[2])))
        .collect()
}

fn coordinates(attrs: &HashMap<String, String>, element: &str) -> Result<Coordinates, ProviderError> {
    let number = |key: &str| -> Result<f64, ProviderError> {
        let raw = attrs
            .get(key)
            .ok_or_else(|| ProviderError::parse(format!("<{}> has no {} attribute", element, key)))?;
        raw.trim()
            .parse()
            .map_err(|_| ProviderError::parse(format!("<{}> has invalid {}: {:?}", element, key, raw)))
    };

    Ok(Coordinates {
        lat: number("lat")?,
        lon: number("lon")?,
    })
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
