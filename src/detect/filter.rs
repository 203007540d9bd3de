use anyhow::{anyhow, Result};
use regex::Regex;

/// Which detector classes feed the aggregation.
///
/// The default is a case-insensitive substring match on `"person"`, which
/// also admits labels such as `people` or `pedestrian_person`. This is a
/// pattern match, not exact class equality.
#[derive(Clone, Debug)]
pub enum ClassFilter {
    Any,
    /// Case-insensitive substring.
    Contains(String),
    /// Case-insensitive exact match against any listed class.
    OneOf(Vec<String>),
    Pattern(Regex),
}

impl Default for ClassFilter {
    fn default() -> Self {
        ClassFilter::Contains("person".to_string())
    }
}

impl ClassFilter {
    /// Parse a filter spec.
    ///
    /// Accepted forms: `any`, `contains:<text>`, `oneof:<a>,<b>`,
    /// `regex:<pattern>`. A bare word is treated as `contains:<word>`.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(anyhow!("class filter must not be empty"));
        }
        if spec.eq_ignore_ascii_case("any") || spec == "*" {
            return Ok(ClassFilter::Any);
        }
        let (kind, arg) = match spec.split_once(':') {
            Some((kind, arg)) => (kind.trim().to_lowercase(), arg.trim()),
            None => return Ok(ClassFilter::Contains(spec.to_lowercase())),
        };
        match kind.as_str() {
            "contains" if !arg.is_empty() => Ok(ClassFilter::Contains(arg.to_lowercase())),
            "oneof" => {
                let classes: Vec<String> = arg
                    .split(',')
                    .map(|c| c.trim().to_lowercase())
                    .filter(|c| !c.is_empty())
                    .collect();
                if classes.is_empty() {
                    return Err(anyhow!("class filter oneof: needs at least one class"));
                }
                Ok(ClassFilter::OneOf(classes))
            }
            "regex" => {
                let re = Regex::new(arg)
                    .map_err(|e| anyhow!("invalid class filter regex {:?}: {}", arg, e))?;
                Ok(ClassFilter::Pattern(re))
            }
            _ => Err(anyhow!("unknown class filter {:?}", spec)),
        }
    }

    pub fn matches(&self, class_name: &str) -> bool {
        match self {
            ClassFilter::Any => true,
            ClassFilter::Contains(needle) => class_name.to_lowercase().contains(needle.as_str()),
            ClassFilter::OneOf(classes) => {
                let class_name = class_name.to_lowercase();
                classes.iter().any(|c| *c == class_name)
            }
            ClassFilter::Pattern(re) => re.is_match(class_name),
        }
    }

    /// Short form for logs.
    pub fn describe(&self) -> String {
        match self {
            ClassFilter::Any => "any".to_string(),
            ClassFilter::Contains(needle) => format!("contains:{}", needle),
            ClassFilter::OneOf(classes) => format!("oneof:{}", classes.join(",")),
            ClassFilter::Pattern(re) => format!("regex:{}", re.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_person_like_labels() {
        let filter = ClassFilter::default();
        assert!(filter.matches("person"));
        assert!(filter.matches("Person"));
        assert!(filter.matches("pedestrian_person"));
        assert!(!filter.matches("car"));
    }

    #[test]
    fn parses_all_forms() {
        assert!(matches!(ClassFilter::parse("any").unwrap(), ClassFilter::Any));
        assert!(ClassFilter::parse("car").unwrap().matches("CAR_sedan"));

        let oneof = ClassFilter::parse("oneof:person, car").unwrap();
        assert!(oneof.matches("Car"));
        assert!(!oneof.matches("cart"));

        let re = ClassFilter::parse("regex:^(person|people)$").unwrap();
        assert!(re.matches("people"));
        assert!(!re.matches("peoples"));
    }

    #[test]
    fn rejects_bad_specs() {
        assert!(ClassFilter::parse("").is_err());
        assert!(ClassFilter::parse("oneof:").is_err());
        assert!(ClassFilter::parse("regex:(").is_err());
        assert!(ClassFilter::parse("glob:*").is_err());
    }
}
