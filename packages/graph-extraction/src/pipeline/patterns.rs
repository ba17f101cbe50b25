//! Relation-verb patterns used by Tier B.
//!
//! A pattern binds a verb lemma plus the (subject, object) node kinds to a
//! relationship kind. Domain patterns name infrastructure relations directly
//! ("depend on", "resolve to"); generic patterns are ordinary grammar ("use",
//! "need") that only suggests a relation.

use crate::types::fact::{NodeKind, RelKind};

/// How specific a pattern is; drives Tier B confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Specificity {
    Domain,
    Generic,
}

impl Specificity {
    pub fn weight(&self) -> f64 {
        match self {
            Specificity::Domain => 0.85,
            Specificity::Generic => 0.6,
        }
    }
}

/// One verb → relationship binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationPattern {
    pub verb: &'static str,
    pub subject: NodeKind,
    pub object: NodeKind,
    pub kind: RelKind,
    pub specificity: Specificity,
}

use NodeKind as N;
use RelKind as R;
use Specificity::{Domain as D, Generic as G};

macro_rules! pattern {
    ($verb:literal, $subject:ident, $object:ident, $kind:ident, $spec:ident) => {
        RelationPattern {
            verb: $verb,
            subject: N::$subject,
            object: N::$object,
            kind: R::$kind,
            specificity: $spec,
        }
    };
}

/// Checked in order; the first match wins.
pub const PATTERNS: &[RelationPattern] = &[
    pattern!("depend on", Service, Service, DependsOn, D),
    pattern!("depend on", Proxy, Service, DependsOn, D),
    pattern!("run on", Service, Host, RunsOn, D),
    pattern!("run on", Proxy, Host, RunsOn, D),
    pattern!("deploy to", Service, Host, RunsOn, D),
    pattern!("resolve to", Host, Ip, ResolvesTo, D),
    pattern!("route to", Proxy, Service, RoutesTo, D),
    pattern!("route to", Proxy, Endpoint, RoutesTo, D),
    pattern!("route to", Proxy, Host, RoutesTo, D),
    pattern!("route to", Service, Service, RoutesTo, D),
    pattern!("proxy to", Proxy, Service, RoutesTo, D),
    pattern!("proxy to", Proxy, Endpoint, RoutesTo, D),
    pattern!("expose", Service, Endpoint, Exposes, D),
    pattern!("expose", Proxy, Endpoint, Exposes, D),
    pattern!("listen on", Service, Port, BindsPort, D),
    pattern!("listen on", Proxy, Port, BindsPort, D),
    pattern!("bind", Service, Port, BindsPort, D),
    pattern!("call", Service, Service, Calls, D),
    pattern!("call", Service, Endpoint, Calls, D),
    pattern!("connect to", Service, Service, ConnectsTo, D),
    pattern!("connect to", Service, Host, ConnectsTo, D),
    pattern!("connect to", Service, Ip, ConnectsTo, D),
    pattern!("connect to", Service, Endpoint, ConnectsTo, D),
    pattern!("use", Service, Service, DependsOn, G),
    pattern!("require", Service, Service, DependsOn, G),
    pattern!("need", Service, Service, DependsOn, G),
    pattern!("point to", Host, Ip, ResolvesTo, G),
    pattern!("reach", Service, Service, ConnectsTo, G),
    pattern!("reach", Service, Endpoint, Calls, G),
];

/// Find the pattern binding `verb` between the two kinds.
pub fn bind(verb: &str, subject: NodeKind, object: NodeKind) -> Option<&'static RelationPattern> {
    PATTERNS
        .iter()
        .find(|p| p.verb == verb && p.subject == subject && p.object == object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_respect_vocabulary() {
        for pattern in PATTERNS {
            assert!(
                pattern.kind.allows(pattern.subject, pattern.object),
                "{} {:?}->{:?}",
                pattern.verb,
                pattern.subject,
                pattern.object
            );
        }
    }

    #[test]
    fn test_bind_by_kinds() {
        let p = bind("depend on", NodeKind::Service, NodeKind::Service).unwrap();
        assert_eq!(p.kind, RelKind::DependsOn);
        assert_eq!(p.specificity, Specificity::Domain);

        assert!(bind("depend on", NodeKind::Service, NodeKind::Port).is_none());
        assert!(bind("talk to", NodeKind::Service, NodeKind::Service).is_none());
        assert!(Specificity::Domain.weight() > Specificity::Generic.weight());
    }
}
