//! Per-source health overview.

use serde::Serialize;

use crate::circuit::CircuitState;
use crate::context::EngineContext;
use crate::models::Source;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceHealth {
    pub source: Source,
    pub configured: bool,
    /// `false` while the source's breaker is open.
    pub healthy: bool,
    pub breaker: Option<CircuitState>,
    pub detail: String,
}

pub(crate) fn source_health(ctx: &EngineContext, source: Source) -> SourceHealth {
    let breaker = match source {
        Source::Local => None,
        Source::RemotePortfolio => ctx.remote().map(|r| r.breaker_state()),
        Source::Collection => ctx.collection().map(|c| c.breaker_state()),
    };

    let (configured, detail) = match source {
        Source::Local => (
            true,
            format!(
                "{} ({} elements)",
                ctx.config().portfolio.root.display(),
                ctx.local().len()
            ),
        ),
        Source::RemotePortfolio => match ctx.remote() {
            Some(remote) => (true, format!("owner {}", remote.owner())),
            None => (false, "NOT CONFIGURED".to_string()),
        },
        Source::Collection => match (ctx.collection(), &ctx.config().collection.url) {
            (Some(_), Some(url)) => (true, url.clone()),
            (Some(_), None) => (true, "custom fetcher".to_string()),
            (None, _) => (false, "NOT CONFIGURED".to_string()),
        },
    };

    let healthy = configured && breaker.map_or(true, |b| b.state != CircuitState::Open);
    SourceHealth {
        source,
        configured,
        healthy,
        breaker: breaker.map(|b| b.state),
        detail,
    }
}

/// Plain-text table, one row per source.
pub fn render_sources(health: &[SourceHealth]) -> String {
    let mut out = format!("{:<18} {:<10} {:<8} DETAIL\n", "SOURCE", "BREAKER", "HEALTHY");
    for h in health {
        let breaker = match h.breaker {
            Some(CircuitState::Closed) => "closed",
            Some(CircuitState::Open) => "open",
            Some(CircuitState::HalfOpen) => "half-open",
            None => "-",
        };
        out.push_str(&format!(
            "{:<18} {:<10} {:<8} {}\n",
            h.source.as_str(),
            breaker,
            h.healthy,
            h.detail
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_one_row_per_source() {
        let rows = vec![
            SourceHealth {
                source: Source::Local,
                configured: true,
                healthy: true,
                breaker: None,
                detail: "./portfolio (3 elements)".into(),
            },
            SourceHealth {
                source: Source::Collection,
                configured: true,
                healthy: false,
                breaker: Some(CircuitState::Open),
                detail: "https://example.org/index.json".into(),
            },
        ];
        let text = render_sources(&rows);
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("collection         open       false"));
    }
}
