//! Templated key paths.
//!
//! A template such as `/discovery/{serviceName}/{instanceId}` compiles into
//! a formatter (fields to path) and the inverse parser (path to fields).
//! Placeholders are matched positionally, one per path segment.

use keystone_common::constants::PATH_SEPARATOR;
use keystone_common::{Fields, KeystoneError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A compiled, immutable path template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    /// Compile a slash-delimited template with `{name}` placeholders
    pub fn compile(template: &str) -> Result<Self> {
        let invalid = |reason: &str| KeystoneError::InvalidTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        if !template.starts_with(PATH_SEPARATOR) {
            return Err(invalid("must start with '/'"));
        }

        let trimmed = template.trim_end_matches(PATH_SEPARATOR);
        let mut segments = Vec::new();
        let mut seen = Vec::new();

        for raw in trimmed.split(PATH_SEPARATOR) {
            let segment = match raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) => {
                    if name.is_empty() || name.contains(['{', '}']) {
                        return Err(invalid("malformed placeholder"));
                    }
                    if seen.contains(&name) {
                        return Err(invalid("duplicate placeholder"));
                    }
                    seen.push(name);
                    Segment::Placeholder(name.to_string())
                }
                None if raw.contains(['{', '}']) => {
                    return Err(invalid("placeholders must span a whole segment"));
                }
                None => Segment::Literal(raw.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    /// The template string this was compiled from
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Placeholder names in path order
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Substitute every placeholder; fails on the first missing field
    pub fn format(&self, fields: &Fields) -> Result<String> {
        let mut parts = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => parts.push(text.as_str()),
                Segment::Placeholder(name) => {
                    let value = fields
                        .get(name)
                        .ok_or_else(|| KeystoneError::MissingField(name.clone()))?;
                    check_value(name, value)?;
                    parts.push(value.as_str());
                }
            }
        }
        Ok(join(&parts))
    }

    /// Format up to the first unresolved placeholder.
    ///
    /// With every field present this is the full path. Otherwise it is the
    /// subtree above the first missing field and ends with a separator, so
    /// `/discovery/svc-A/` never matches `/discovery/svc-AB/...`.
    pub fn prefix(&self, fields: &Fields) -> Result<String> {
        let mut parts = Vec::with_capacity(self.segments.len());
        let mut complete = true;
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => parts.push(text.as_str()),
                Segment::Placeholder(name) => match fields.get(name) {
                    Some(value) => {
                        check_value(name, value)?;
                        parts.push(value.as_str());
                    }
                    None => {
                        complete = false;
                        break;
                    }
                },
            }
        }

        let path = join(&parts);
        if complete || path.ends_with(PATH_SEPARATOR) {
            Ok(path)
        } else {
            Ok(format!("{}{}", path, PATH_SEPARATOR))
        }
    }

    /// True when `fields` resolves every placeholder
    pub fn is_complete(&self, fields: &Fields) -> bool {
        self.placeholders().all(|name| fields.contains_key(name))
    }

    /// Recover named fields from a path; literal segments are ignored
    pub fn parse(&self, path: &str) -> Fields {
        self.segments
            .iter()
            .zip(path.split(PATH_SEPARATOR))
            .filter_map(|(segment, part)| match segment {
                Segment::Placeholder(name) if !part.is_empty() => {
                    Some((name.clone(), part.to_string()))
                }
                _ => None,
            })
            .collect()
    }
}

impl std::fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for PathTemplate {
    type Err = KeystoneError;

    fn from_str(s: &str) -> Result<Self> {
        Self::compile(s)
    }
}

fn check_value(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(KeystoneError::InvalidFieldValue {
            field: name.to_string(),
            reason: "empty".to_string(),
        });
    }
    if value.contains(PATH_SEPARATOR) {
        return Err(KeystoneError::InvalidFieldValue {
            field: name.to_string(),
            reason: format!("contains '{}'", PATH_SEPARATOR),
        });
    }
    Ok(())
}

fn join(parts: &[&str]) -> String {
    let path = parts.join(&PATH_SEPARATOR.to_string());
    let trimmed = path.trim_end_matches(PATH_SEPARATOR);
    if trimmed.is_empty() {
        PATH_SEPARATOR.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_common::constants::templates;
    use keystone_common::fields;

    #[test]
    fn test_format_and_parse_round_trip() {
        let cases = [
            (templates::DISCOVERY, fields([("serviceName", "svc-A"), ("instanceId", "i1")])),
            (templates::ALGORITHM_QUEUE, fields([("name", "green-alg")])),
            (templates::JOB_TASKS, fields([("jobId", "job-1"), ("taskId", "t-9")])),
        ];

        for (source, input) in cases {
            let template = PathTemplate::compile(source).unwrap();
            let path = template.format(&input).unwrap();
            assert_eq!(template.parse(&path), input, "template {}", source);
        }
    }

    #[test]
    fn test_format_substitutes_in_order() {
        let template = PathTemplate::compile(templates::DISCOVERY).unwrap();
        let path = template
            .format(&fields([("instanceId", "i1"), ("serviceName", "svc-A")]))
            .unwrap();
        assert_eq!(path, "/discovery/svc-A/i1");
    }

    #[test]
    fn test_trailing_separator_is_trimmed() {
        let template = PathTemplate::compile("/algorithms/queue/{name}/").unwrap();
        let path = template.format(&fields([("name", "x")])).unwrap();
        assert_eq!(path, "/algorithms/queue/x");
    }

    #[test]
    fn test_missing_field_fails_fast() {
        let template = PathTemplate::compile(templates::JOB_TASKS).unwrap();
        let err = template.format(&fields([("jobId", "job-1")])).unwrap_err();
        assert!(matches!(err, KeystoneError::MissingField(name) if name == "taskId"));
    }

    #[test]
    fn test_value_with_separator_is_rejected() {
        let template = PathTemplate::compile(templates::ALGORITHM_QUEUE).unwrap();
        let err = template.format(&fields([("name", "a/b")])).unwrap_err();
        assert!(matches!(err, KeystoneError::InvalidFieldValue { .. }));
    }

    #[test]
    fn test_prefix_stops_at_first_missing_field() {
        let template = PathTemplate::compile(templates::JOB_TASKS).unwrap();
        assert_eq!(template.prefix(&Fields::new()).unwrap(), "/jobs/tasks/");
        assert_eq!(
            template.prefix(&fields([("jobId", "job-1")])).unwrap(),
            "/jobs/tasks/job-1/"
        );
        // taskId alone does not extend the prefix past jobId
        assert_eq!(
            template.prefix(&fields([("taskId", "t")])).unwrap(),
            "/jobs/tasks/"
        );
    }

    #[test]
    fn test_complete_prefix_is_the_full_path() {
        let template = PathTemplate::compile(templates::JOB_TASKS).unwrap();
        let all = fields([("jobId", "job-1"), ("taskId", "t1")]);
        assert!(template.is_complete(&all));
        assert_eq!(template.prefix(&all).unwrap(), template.format(&all).unwrap());
        assert!(!template.is_complete(&fields([("jobId", "job-1")])));

        let root: PathTemplate = "/{name}".parse().unwrap();
        assert_eq!(root.prefix(&Fields::new()).unwrap(), "/");
    }

    #[test]
    fn test_parse_ignores_literals_and_short_paths() {
        let template = PathTemplate::compile(templates::DISCOVERY).unwrap();
        assert_eq!(
            template.parse("/somewhere-else/svc-B/i7"),
            fields([("serviceName", "svc-B"), ("instanceId", "i7")])
        );
        assert_eq!(
            template.parse("/discovery/svc-B"),
            fields([("serviceName", "svc-B")])
        );
    }

    #[test]
    fn test_compile_rejects_malformed_templates() {
        assert!(PathTemplate::compile("discovery/{a}").is_err());
        assert!(PathTemplate::compile("/a/{}").is_err());
        assert!(PathTemplate::compile("/a/{x}/{x}").is_err());
        assert!(PathTemplate::compile("/a/pre{x}").is_err());
    }

    #[test]
    fn test_placeholders_in_path_order() {
        let template: PathTemplate = templates::JOB_TASKS.parse().unwrap();
        let names: Vec<_> = template.placeholders().collect();
        assert_eq!(names, vec!["jobId", "taskId"]);
    }
}
