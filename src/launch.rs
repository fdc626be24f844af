use std::path::PathBuf;

const SCHEME: &str = "priorviewer://";

/// A local store to open, and optionally which of its studies to show first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub store: PathBuf,
    /// Empty means the most recent study in the store.
    pub studies: Vec<String>,
}

pub fn parse_launch_request_from_args(args: &[String]) -> Result<Option<LaunchRequest>, String> {
    if args.is_empty() {
        return Ok(None);
    }

    if args.len() == 1 && strip_scheme(&args[0]).is_some() {
        return parse_viewer_uri(&args[0]).map(Some);
    }

    let mut store = None::<PathBuf>;
    let mut studies = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--store" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "Missing directory after --store.".to_string())?;
                store = Some(PathBuf::from(value));
            }
            "--study" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "Missing study instance UID after --study.".to_string())?;
                studies.extend(split_study_list(value));
            }
            positional if store.is_none() => store = Some(PathBuf::from(positional)),
            positional => studies.extend(split_study_list(positional)),
        }
    }

    let store = store.ok_or_else(|| "A store directory is required.".to_string())?;
    Ok(Some(LaunchRequest { store, studies }))
}

pub fn parse_viewer_uri(uri: &str) -> Result<LaunchRequest, String> {
    let rest = strip_scheme(uri).ok_or_else(|| format!("URL must start with {SCHEME}"))?;
    let (location, query) = rest.split_once('?').unwrap_or((rest, ""));
    let location = location.trim().trim_end_matches('/');
    if !location.is_empty() && !location.eq_ignore_ascii_case("open") {
        return Err(format!("Unsupported action '{location}'; expected 'open'."));
    }

    let mut store = None::<PathBuf>;
    let mut studies = Vec::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = percent_decode(value)?;
        match key.trim().to_ascii_lowercase().as_str() {
            "store" | "dir" | "path" => {
                if !value.trim().is_empty() {
                    store = Some(PathBuf::from(value.trim()));
                }
            }
            "study" | "studies" | "studyuid" | "study_instance_uid" => {
                studies.extend(split_study_list(&value));
            }
            other => log::debug!("Ignoring launch parameter '{other}'"),
        }
    }

    let store = store.ok_or_else(|| "Launch URL requires 'store'.".to_string())?;
    Ok(LaunchRequest { store, studies })
}

fn strip_scheme(uri: &str) -> Option<&str> {
    if uri.len() >= SCHEME.len() && uri[..SCHEME.len()].eq_ignore_ascii_case(SCHEME) {
        Some(&uri[SCHEME.len()..])
    } else {
        None
    }
}

fn split_study_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split([',', '|'])
        .map(str::trim)
        .filter(|uid| !uid.is_empty())
        .map(str::to_string)
}

fn percent_decode(value: &str) -> Result<String, String> {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                decoded.push(b' ');
                index += 1;
            }
            b'%' => {
                let digits = bytes
                    .get(index + 1..index + 3)
                    .and_then(|pair| Some((hex_digit(pair[0])? << 4) | hex_digit(pair[1])?))
                    .ok_or_else(|| "Invalid percent-encoding in URL.".to_string())?;
                decoded.push(digits);
                index += 3;
            }
            byte => {
                decoded.push(byte);
                index += 1;
            }
        }
    }

    String::from_utf8(decoded).map_err(|_| "URL contains invalid UTF-8 after decoding.".to_string())
}

fn hex_digit(value: u8) -> Option<u8> {
    match value {
        b'0'..=b'9' => Some(value - b'0'),
        b'a'..=b'f' => Some(value - b'a' + 10),
        b'A'..=b'F' => Some(value - b'A' + 10),
        _ => None,
    }
}
