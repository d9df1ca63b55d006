//! Tool-style invocation boundary for an external orchestration layer.
//!
//! Four tools, one JSON object each way, tagged by `tool`:
//!   resolve_entities   records            -> canonical entities
//!   compute_metrics    tenant, period,    -> metric values + lineage
//!                      entities
//!   detect_anomalies   metric series      -> anomalies
//!   list_metrics                          -> ontology summary
//!
//! A failing request becomes an `error` response; the host never sees a
//! panic or a dropped line.

use crate::{
    anomaly_detector::Anomaly,
    canonical::CanonicalEntity,
    engine::RevenuePipeline,
    error::{PipelineError, PipelineResult, Stage},
    metric_engine::MetricValue,
    ontology::MetricSummary,
    record::NormalizedRecord,
    resolver::ResolutionStats,
    scoring::MatchScore,
    types::{EntityId, MetricId, Period, TenantId},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolRequest {
    ResolveEntities {
        records: Vec<NormalizedRecord>,
    },
    ComputeMetrics {
        tenant_id: TenantId,
        period:    Period,
        entities:  Vec<CanonicalEntity>,
        /// One metric only; every metric when absent.
        #[serde(default)]
        metric_id: Option<MetricId>,
    },
    DetectAnomalies {
        series: Vec<MetricValue>,
    },
    ListMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolResponse {
    ResolveEntities {
        entities: Vec<CanonicalEntity>,
        review:   Vec<MatchScore>,
        stats:    ResolutionStats,
    },
    ComputeMetrics {
        metric_values: Vec<MetricValue>,
        lineage:       BTreeMap<MetricId, Vec<EntityId>>,
    },
    DetectAnomalies {
        anomalies: Vec<Anomaly>,
    },
    ListMetrics {
        ontology: String,
        metrics:  Vec<MetricSummary>,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
    },
}

impl ToolResponse {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    fn from_error(err: &PipelineError) -> Self {
        Self::Error {
            error: err.to_string(),
            stage: err.stage().map(|s| s.to_string()),
        }
    }
}

/// Dispatch one request against `pipeline`.
pub fn handle_request(pipeline: &mut RevenuePipeline, request: ToolRequest) -> ToolResponse {
    match dispatch(pipeline, request) {
        Ok(response) => response,
        Err(err) => {
            log::warn!("invocation: request failed: {err}");
            ToolResponse::from_error(&err)
        }
    }
}

/// Parse one JSON line, dispatch it, and serialize the response.
pub fn handle_line(pipeline: &mut RevenuePipeline, line: &str) -> String {
    let response = match serde_json::from_str::<ToolRequest>(line) {
        Ok(request) => handle_request(pipeline, request),
        Err(e) => ToolResponse::Error {
            error: format!("Unparseable request: {e}"),
            stage: None,
        },
    };
    serde_json::to_string(&response).unwrap_or_else(|e| {
        format!(r#"{{"tool":"error","error":"Cannot serialize response: {e}"}}"#)
    })
}

fn dispatch(pipeline: &mut RevenuePipeline, request: ToolRequest) -> PipelineResult<ToolResponse> {
    match request {
        ToolRequest::ResolveEntities { records } => {
            let report = pipeline.resolver().resolve_detailed(&records)?;
            Ok(ToolResponse::ResolveEntities {
                entities: report.entities,
                review:   report.review,
                stats:    report.stats,
            })
        }

        ToolRequest::ComputeMetrics { tenant_id, period, entities, metric_id: Some(metric_id) } => {
            let engine = pipeline.engine();
            let needed = engine.ontology().closure(&metric_id).ok_or_else(|| {
                PipelineError::UnknownMetric { stage: Stage::Metrics, metric_id: metric_id.clone() }
            })?;
            let mut computation = engine.evaluate(&tenant_id, period, &entities, &needed)?;
            let mut lineage = BTreeMap::new();
            if let Some(ids) = computation.lineage.remove(&metric_id) {
                lineage.insert(metric_id.clone(), ids);
            }
            let metric_values = computation
                .values
                .into_iter()
                .filter(|v| v.metric_id == metric_id)
                .collect();
            Ok(ToolResponse::ComputeMetrics { metric_values, lineage })
        }

        ToolRequest::ComputeMetrics { tenant_id, period, entities, metric_id: None } => {
            let engine = pipeline.engine_mut();
            let metric_values = engine.compute_all(&tenant_id, period, &entities)?;
            let lineage = metric_values
                .iter()
                .map(|v| {
                    let ids = engine
                        .lineage(&tenant_id, &v.metric_id, period)
                        .map(<[EntityId]>::to_vec)
                        .unwrap_or_default();
                    (v.metric_id.clone(), ids)
                })
                .collect();
            Ok(ToolResponse::ComputeMetrics { metric_values, lineage })
        }

        ToolRequest::DetectAnomalies { series } => {
            let mut grouped: BTreeMap<(TenantId, MetricId), Vec<MetricValue>> = BTreeMap::new();
            for v in series {
                grouped.entry((v.tenant_id.clone(), v.metric_id.clone())).or_default().push(v);
            }
            let mut anomalies = Vec::new();
            for values in grouped.values() {
                anomalies.extend(pipeline.detector().detect(values)?);
            }
            Ok(ToolResponse::DetectAnomalies { anomalies })
        }

        ToolRequest::ListMetrics => {
            let ontology = pipeline.ontology();
            Ok(ToolResponse::ListMetrics {
                ontology: ontology.name().to_string(),
                metrics:  ontology.summary(),
            })
        }
    }
}
