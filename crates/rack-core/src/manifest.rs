//! Service index over manifest text.
//!
//! Full manifest parsing lives outside the rack. The control plane only
//! needs the service names (registry tags, image cleanup) and whether a
//! service runs as a per-host agent, so this reads just enough of the
//! YAML block structure to answer those two questions.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestService {
    pub name: String,
    pub agent: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceIndex {
    services: Vec<ManifestService>,
}

impl ServiceIndex {
    /// Services are the children of a top-level `services:` key when one
    /// is present, otherwise every top-level key except `version`.
    pub fn parse(text: &str) -> Self {
        let lines: Vec<(usize, &str)> = text
            .lines()
            .filter_map(|raw| {
                let trimmed = strip_comment(raw).trim_end();
                if trimmed.trim().is_empty() {
                    return None;
                }
                let indent = trimmed.len() - trimmed.trim_start().len();
                Some((indent, trimmed.trim_start()))
            })
            .collect();

        let nested = lines
            .iter()
            .position(|(indent, line)| *indent == 0 && key_of(line) == Some("services"));

        let (body, base): (&[(usize, &str)], usize) = match nested {
            Some(at) => {
                let rest = &lines[at + 1..];
                let end = rest
                    .iter()
                    .position(|(indent, _)| *indent == 0)
                    .unwrap_or(rest.len());
                let body = &rest[..end];
                let base = body.first().map(|(indent, _)| *indent).unwrap_or(0);
                (body, base)
            }
            None => (&lines[..], 0),
        };

        let mut services: Vec<ManifestService> = Vec::new();
        let mut in_agent_block: Option<usize> = None;

        for (indent, line) in body {
            if *indent == base {
                in_agent_block = None;
                if let Some(key) = key_of(line) {
                    if nested.is_none() && key == "version" {
                        continue;
                    }
                    services.push(ManifestService {
                        name: key.to_string(),
                        agent: false,
                    });
                }
                continue;
            }

            let Some(current) = services.last_mut() else {
                continue;
            };

            if let Some(agent_indent) = in_agent_block {
                if *indent > agent_indent {
                    if key_of(line) == Some("enabled") && value_of(line) == Some("true") {
                        current.agent = true;
                    }
                    continue;
                }
                in_agent_block = None;
            }

            if key_of(line) == Some("agent") {
                match value_of(line) {
                    Some("true") => current.agent = true,
                    Some(_) => {}
                    None => in_agent_block = Some(*indent),
                }
            }
        }

        Self { services }
    }

    pub fn services(&self) -> &[ManifestService] {
        &self.services
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|s| s.name.as_str())
    }

    pub fn agents(&self) -> impl Iterator<Item = &str> {
        self.services
            .iter()
            .filter(|s| s.agent)
            .map(|s| s.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find(" #") {
        Some(i) => &line[..i],
        None if line.trim_start().starts_with('#') => "",
        None => line,
    }
}

fn key_of(line: &str) -> Option<&str> {
    if line.starts_with('-') {
        return None;
    }
    let (key, _) = line.split_once(':')?;
    let key = key.trim().trim_matches(|c| c == '"' || c == '\'');
    (!key.is_empty()).then_some(key)
}

fn value_of(line: &str) -> Option<&str> {
    let (_, value) = line.split_once(':')?;
    let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
    (!value.is_empty()).then_some(value)
}
