//! Policy instances carried on record columns.

use std::fmt;

use k9db_sqlast::Value;

/// A concrete policy attached to one column of one row: a named clause
/// bound to its parameter values, or a conjunction/disjunction of them.
#[derive(Debug, Clone, PartialEq)]
pub enum Policy {
    Clause { name: String, values: Vec<Value> },
    And(Vec<Policy>),
    Or(Vec<Policy>),
}

impl Policy {
    pub fn clause(name: impl Into<String>, values: Vec<Value>) -> Policy {
        Policy::Clause {
            name: name.into(),
            values,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Policy::Clause { name, .. } => name,
            Policy::And(_) => "AND",
            Policy::Or(_) => "OR",
        }
    }

    /// Wire form shown to clients, e.g. `AccessControl(1, 'admin')`.
    pub fn serialize(&self) -> String {
        match self {
            Policy::Clause { name, values } => {
                let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                format!("{}({})", name, values.join(", "))
            }
            Policy::And(policies) => {
                let parts: Vec<String> = policies.iter().map(|p| p.serialize()).collect();
                format!("AND[{}]", parts.join("; "))
            }
            Policy::Or(policies) => {
                let parts: Vec<String> = policies.iter().map(|p| p.serialize()).collect();
                format!("OR[{}]", parts.join("; "))
            }
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serialize())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn serialization() {
        let single = Policy::clause("AccessControl", vec![Value::Int(1), "admin".into()]);
        assert_eq!(single.serialize(), "AccessControl(1, 'admin')");

        let both = Policy::And(vec![
            single.clone(),
            Policy::clause("Consent", vec![Value::Uint(1)]),
        ]);
        assert_eq!(both.serialize(), "AND[AccessControl(1, 'admin'); Consent(1)]");
        assert_eq!(both.name(), "AND");
    }
}
