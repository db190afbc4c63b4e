//! Rewrite directives and the per-unit report

use serde::Serialize;
use sideload_bytecode::Signature;

use crate::registry::InterfaceRegistry;

/// What the rewriter does with one entry point
///
/// Parameter indices are zero-based and exclude the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RewriteDirective {
    /// No mapped type in the signature
    NoOp,
    /// Mapped types only in return position; left unchanged
    ReturnOnly,
    /// Direct mapped parameters; declared type becomes the interface and a
    /// cast back to the concrete type is prepended
    ParameterRewrite {
        /// Rewritten parameters
        params: Vec<usize>,
    },
    /// Mapped type one level inside an array, container or function
    /// parameter; an adapting overload is added next to the original
    SynthesizeOverload {
        /// Parameters the overload adapts
        params: Vec<usize>,
    },
    /// Mapped type nested two or more levels deep; left as-is
    Unrewritable {
        /// Offending parameters
        params: Vec<usize>,
    },
}

impl RewriteDirective {
    /// Derive the directive for a signature
    ///
    /// Static entry points are never rewritten.
    pub fn classify(signature: &Signature, is_static: bool, registry: &InterfaceRegistry) -> Self {
        if is_static {
            return RewriteDirective::NoOp;
        }

        let mut direct = Vec::new();
        let mut nested = Vec::new();
        let mut deep = Vec::new();
        for (index, param) in signature.params.iter().enumerate() {
            match registry.mapped_depth(param) {
                Some(0) => direct.push(index),
                Some(1) => nested.push(index),
                Some(_) => deep.push(index),
                None => {}
            }
        }

        if !deep.is_empty() {
            RewriteDirective::Unrewritable { params: deep }
        } else if !nested.is_empty() {
            let mut params: Vec<usize> = direct.into_iter().chain(nested).collect();
            params.sort_unstable();
            RewriteDirective::SynthesizeOverload { params }
        } else if !direct.is_empty() {
            RewriteDirective::ParameterRewrite { params: direct }
        } else if registry.mapped_depth(&signature.ret).is_some() {
            RewriteDirective::ReturnOnly
        } else {
            RewriteDirective::NoOp
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            RewriteDirective::NoOp => "no_op",
            RewriteDirective::ReturnOnly => "return_only",
            RewriteDirective::ParameterRewrite { .. } => "parameter_rewrite",
            RewriteDirective::SynthesizeOverload { .. } => "synthesize_overload",
            RewriteDirective::Unrewritable { .. } => "unrewritable",
        }
    }
}

/// Directive applied to one authored entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryReport {
    /// Entry point name
    pub name: String,
    /// Authored signature
    pub signature: String,
    /// Directive derived for it
    pub directive: RewriteDirective,
}

/// Adapter that would have duplicated an authored signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmbiguousCollision {
    /// Entry point name
    pub operation: String,
    /// Signature that already exists
    pub signature: String,
}

/// Shape the rewriter leaves alone on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitationKind {
    /// Mapped type nested too deep to adapt
    Unrewritable,
    /// Static entry point mentioning a mapped type; reachable only by name
    StaticUnadapted,
}

/// Known limitation recorded for an entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Limitation {
    /// Entry point name
    pub operation: String,
    /// Authored signature
    pub signature: String,
    /// Kind of limitation
    pub kind: LimitationKind,
}

/// Everything the rewriter did to one unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RewriteReport {
    /// Unit name
    pub unit: String,
    /// Interface added to the declared capabilities
    pub injected: Option<String>,
    /// Directive per authored entry point, in declaration order
    pub entries: Vec<EntryReport>,
    /// Signatures of synthesized overloads, rendered as `name(params)->ret`
    pub synthesized: Vec<String>,
    /// Adapters skipped because the signature was already authored
    pub ambiguous: Vec<AmbiguousCollision>,
    /// Shapes left as-is
    pub limitations: Vec<Limitation>,
}

impl RewriteReport {
    /// Directive recorded for an authored entry point
    pub fn directive_for(&self, name: &str, signature: &str) -> Option<&RewriteDirective> {
        self.entries
            .iter()
            .find(|e| e.name == name && e.signature == signature)
            .map(|e| &e.directive)
    }

    /// Render as JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CapabilityInterface;

    fn registry() -> InterfaceRegistry {
        let mut registry = InterfaceRegistry::new();
        registry
            .declare(CapabilityInterface::new("api.Boxed"))
            .unwrap();
        registry.map("impl.Box", "api.Boxed").unwrap();
        registry
    }

    fn classify(signature: &str) -> RewriteDirective {
        let signature = Signature::parse(signature).unwrap();
        RewriteDirective::classify(&signature, false, &registry())
    }

    #[test]
    fn test_classify_shapes() {
        assert_eq!(classify("(int)->int"), RewriteDirective::NoOp);
        assert_eq!(classify("(int)->impl.Box"), RewriteDirective::ReturnOnly);
        assert_eq!(
            classify("(impl.Box[])->impl.Box[]"),
            RewriteDirective::SynthesizeOverload { params: vec![0] }
        );
        assert_eq!(
            classify("(int,impl.Box)->int"),
            RewriteDirective::ParameterRewrite { params: vec![1] }
        );
        assert_eq!(
            classify("(List<List<impl.Box>>)->int"),
            RewriteDirective::Unrewritable { params: vec![0] }
        );
    }

    #[test]
    fn test_most_conservative_directive_wins() {
        assert_eq!(
            classify("(impl.Box,fn(impl.Box)->int)->int"),
            RewriteDirective::SynthesizeOverload { params: vec![0, 1] }
        );
        assert_eq!(
            classify("(impl.Box,impl.Box[],impl.Box[][])->int"),
            RewriteDirective::Unrewritable { params: vec![2] }
        );
    }

    #[test]
    fn test_static_is_never_rewritten() {
        let signature = Signature::parse("(impl.Box)->int").unwrap();
        assert_eq!(
            RewriteDirective::classify(&signature, true, &registry()),
            RewriteDirective::NoOp
        );
    }

    #[test]
    fn test_report_json() {
        let report = RewriteReport {
            unit: "impl.Wrapper".to_string(),
            entries: vec![EntryReport {
                name: "apply".to_string(),
                signature: "(impl.Box)->int".to_string(),
                directive: RewriteDirective::ParameterRewrite { params: vec![0] },
            }],
            ..Default::default()
        };

        let json = report.to_json().unwrap();
        assert!(json.contains("\"kind\": \"parameter_rewrite\""));
        assert_eq!(
            report.directive_for("apply", "(impl.Box)->int"),
            Some(&RewriteDirective::ParameterRewrite { params: vec![0] })
        );
    }
}
