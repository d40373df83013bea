use crate::error::{ProvisionError, Result};

/// Hostname template of the form `prefix{start}` or `prefix{start,fixed=width}`
///
/// Text after the closing brace is carried through as a suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameTemplate {
    prefix: String,
    start: u64,
    width: usize,
    suffix: String,
}

impl NameTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let (prefix, rest) = template.split_once('{').ok_or_else(|| {
            ProvisionError::config(format!(
                "name template {:?} has no {{start}} group",
                template
            ))
        })?;
        let (group, suffix) = rest.split_once('}').ok_or_else(|| {
            ProvisionError::config(format!("name template {:?} has an unterminated group", template))
        })?;

        let mut parts = group.split(',');
        let start_str = parts.next().unwrap_or_default().trim();
        let start = start_str.parse::<u64>().map_err(|e| {
            ProvisionError::config(format!(
                "name template start {:?} is not an integer: {}",
                start_str, e
            ))
        })?;

        let width = match parts.next() {
            None => 0,
            Some(option) => {
                let (key, value) = option.split_once('=').ok_or_else(|| {
                    ProvisionError::config(format!("name template option {:?} is not fixed=<n>", option))
                })?;
                if key.trim() != "fixed" {
                    return Err(ProvisionError::config(format!(
                        "unknown name template option {:?}",
                        key.trim()
                    )));
                }
                value.trim().parse::<usize>().map_err(|e| {
                    ProvisionError::config(format!(
                        "name template fixed={:?} is not an integer: {}",
                        value.trim(),
                        e
                    ))
                })?
            }
        };

        if let Some(extra) = parts.next() {
            return Err(ProvisionError::config(format!(
                "unexpected name template option {:?}",
                extra
            )));
        }

        Ok(Self {
            prefix: prefix.to_string(),
            start,
            width,
            suffix: suffix.to_string(),
        })
    }

    /// Fails when the last of `replica` numbers does not fit in a u64
    pub fn check_range(&self, replica: usize) -> Result<()> {
        let span = replica.saturating_sub(1) as u64;
        self.start.checked_add(span).map(|_| ()).ok_or_else(|| {
            ProvisionError::config(format!(
                "name template starting at {} cannot number {} hosts",
                self.start, replica
            ))
        })
    }

    /// Hostname for the 0-based replica `index`
    pub fn hostname(&self, index: usize) -> String {
        format!(
            "{}{:0width$}{}",
            self.prefix,
            self.start.saturating_add(index as u64),
            self.suffix,
            width = self.width
        )
    }

    /// First `replica` hostnames, in order
    pub fn sequence(&self, replica: usize) -> Vec<String> {
        (0..replica).map(|i| self.hostname(i)).collect()
    }
}
