// 📊 Aggregator - per (razão social, UF) statistics and ranking
//
// Values are first summed per (ano, trimestre) inside each group, then the
// group statistics run over those per-quarter values. Output order is the
// ranking order, which depends only on the data, never on input row order.

use crate::config::{AggregationSettings, PipelineConfig};
use crate::enrichment::{round2, EnrichedRecord};
use crate::flags::InconsistencyFlag;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Group key used when razão social or UF is unknown
pub const PLACEHOLDER: &str = "NÃO_INFORMADO";

const LOW_VARIABILITY_CV: f64 = 25.0;
const TOP_GROUPS: usize = 10;
const TOP_UFS: usize = 5;

// ============================================================================
// CORE TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateGroup {
    pub razao_social: String,
    pub uf: String,
    pub total_despesas: f64,
    pub media_despesas: f64,
    pub media_por_trimestre: f64,
    /// Population standard deviation of the per-quarter values
    pub desvio_padrao: f64,
    /// Percent, rounded to 2 decimals
    pub coeficiente_variacao: f64,
    pub numero_trimestres: usize,
    pub ranking: usize,
    pub alta_variabilidade: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariabilityDistribution {
    pub baixa: usize,
    pub media: usize,
    pub alta: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedGroup {
    pub ranking: usize,
    pub razao_social: String,
    pub uf: String,
    pub total_despesas: f64,
}

/// Statistics over the group totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationSummary {
    pub group_count: usize,
    pub distinct_ufs: usize,
    pub total_sum: f64,
    pub total_mean: f64,
    pub total_median: f64,
    pub total_min: f64,
    pub total_max: f64,
    pub total_std_dev: f64,
    pub high_variability_groups: usize,
    pub top_groups: Vec<RankedGroup>,
    /// (uf, summed totals), highest first
    pub top_ufs: Vec<(String, f64)>,
    pub variability: VariabilityDistribution,
}

impl AggregationSummary {
    pub fn summary(&self) -> String {
        format!(
            "{} groups across {} UFs, total {:.2}, {} with high variability",
            self.group_count, self.distinct_ufs, self.total_sum, self.high_variability_groups
        )
    }
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Sum starting from +0.0; `Iterator::sum` over no f64 values is -0.0,
/// which ranks below 0.0 under `total_cmp` and prints as "-0.00"
fn total(values: &[f64]) -> f64 {
    values.iter().fold(0.0, |acc, v| acc + v)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    total(values) / values.len() as f64
}

/// Population standard deviation (divisor n); 0 for fewer than two values
fn population_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn median(sorted: &[f64]) -> f64 {
    match sorted.len() {
        0 => 0.0,
        n if n % 2 == 1 => sorted[n / 2],
        n => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
    }
}

/// CV in percent, rounded; 0 when the mean is 0
pub fn coefficient_of_variation(std_dev: f64, mean: f64) -> f64 {
    if mean == 0.0 {
        0.0
    } else {
        round2(std_dev / mean * 100.0)
    }
}

// ============================================================================
// AGGREGATOR
// ============================================================================

type QuarterKey = (Option<i64>, Option<i64>);

pub struct Aggregator {
    settings: AggregationSettings,
}

impl Aggregator {
    pub fn new(config: &PipelineConfig) -> Self {
        Aggregator {
            settings: config.aggregation.clone(),
        }
    }

    pub fn with_settings(settings: AggregationSettings) -> Self {
        Aggregator { settings }
    }

    /// Group key for a record: source name, then registry name, then placeholder
    pub fn group_key(record: &EnrichedRecord) -> (String, String) {
        let source_name = &record.validated.razao_social;
        let razao_social = if !source_name.is_empty()
            && !record.validated.flags.contains(InconsistencyFlag::RazaoVazia)
        {
            source_name.clone()
        } else {
            record
                .razao_social_cadastro
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .unwrap_or(PLACEHOLDER)
                .to_string()
        };

        let uf = record
            .uf
            .as_deref()
            .map(str::trim)
            .filter(|uf| !uf.is_empty())
            .unwrap_or(PLACEHOLDER)
            .to_string();

        (razao_social, uf)
    }

    /// Value contributed to the group sum, if any
    fn contribution(record: &EnrichedRecord) -> Option<f64> {
        if record.flags.iter().any(|f| f.excludes_value()) {
            return None;
        }
        record.validated.valor_despesas
    }

    /// One group per distinct key, ranked
    pub fn aggregate(&self, records: &[EnrichedRecord]) -> Vec<AggregateGroup> {
        let mut quarters: BTreeMap<(String, String), BTreeMap<QuarterKey, f64>> = BTreeMap::new();

        for record in records {
            let per_quarter = quarters.entry(Self::group_key(record)).or_default();
            if let Some(value) = Self::contribution(record) {
                let quarter = (record.validated.ano, record.validated.trimestre);
                *per_quarter.entry(quarter).or_insert(0.0) += value;
            }
        }

        let mut groups: Vec<AggregateGroup> = quarters
            .into_iter()
            .map(|((razao_social, uf), per_quarter)| {
                let values: Vec<f64> = per_quarter.into_values().collect();
                self.build_group(razao_social, uf, &values)
            })
            .collect();

        Self::rank(&mut groups);
        groups
    }

    fn build_group(&self, razao_social: String, uf: String, values: &[f64]) -> AggregateGroup {
        let numero_trimestres = values.len();
        let total_despesas = total(values);
        let media_despesas = mean(values);
        let desvio_padrao = if numero_trimestres == 1 {
            0.0
        } else {
            population_std_dev(values)
        };
        let coeficiente_variacao = coefficient_of_variation(desvio_padrao, media_despesas);

        AggregateGroup {
            razao_social,
            uf,
            total_despesas,
            media_despesas,
            media_por_trimestre: media_despesas,
            desvio_padrao,
            coeficiente_variacao,
            numero_trimestres,
            ranking: 0,
            alta_variabilidade: coeficiente_variacao > self.settings.cv_threshold,
        }
    }

    /// Sort by total descending, ties by (razao_social, uf); assign 1..N
    pub fn rank(groups: &mut [AggregateGroup]) {
        groups.sort_by(|a, b| {
            b.total_despesas
                .total_cmp(&a.total_despesas)
                .then_with(|| a.razao_social.cmp(&b.razao_social))
                .then_with(|| a.uf.cmp(&b.uf))
        });
        for (position, group) in groups.iter_mut().enumerate() {
            group.ranking = position + 1;
        }
    }

    /// Aggregate and summarize in one pass
    pub fn run(&self, records: &[EnrichedRecord]) -> (Vec<AggregateGroup>, AggregationSummary) {
        let groups = self.aggregate(records);
        let summary = self.summarize(&groups);
        info!("aggregation: {}", summary.summary());
        (groups, summary)
    }

    /// Statistics over ranked groups
    pub fn summarize(&self, groups: &[AggregateGroup]) -> AggregationSummary {
        if groups.is_empty() {
            return AggregationSummary::default();
        }

        let totals: Vec<f64> = groups.iter().map(|g| g.total_despesas).collect();
        let mut sorted = totals.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let mut by_uf: BTreeMap<&str, f64> = BTreeMap::new();
        for group in groups {
            *by_uf.entry(group.uf.as_str()).or_insert(0.0) += group.total_despesas;
        }
        let distinct_ufs = by_uf.len();
        let mut top_ufs: Vec<(String, f64)> =
            by_uf.into_iter().map(|(uf, total)| (uf.to_string(), total)).collect();
        top_ufs.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_ufs.truncate(TOP_UFS);

        let mut variability = VariabilityDistribution::default();
        for group in groups {
            if group.coeficiente_variacao > self.settings.cv_threshold {
                variability.alta += 1;
            } else if group.coeficiente_variacao >= LOW_VARIABILITY_CV {
                variability.media += 1;
            } else {
                variability.baixa += 1;
            }
        }

        let top_groups = groups
            .iter()
            .take(TOP_GROUPS)
            .map(|g| RankedGroup {
                ranking: g.ranking,
                razao_social: g.razao_social.clone(),
                uf: g.uf.clone(),
                total_despesas: g.total_despesas,
            })
            .collect();

        AggregationSummary {
            group_count: groups.len(),
            distinct_ufs,
            total_sum: total(&totals),
            total_mean: mean(&totals),
            total_median: median(&sorted),
            total_min: sorted[0],
            total_max: sorted[sorted.len() - 1],
            total_std_dev: population_std_dev(&totals),
            high_variability_groups: groups.iter().filter(|g| g.alta_variabilidade).count(),
            top_groups,
            top_ufs,
            variability,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consolidation::ConsolidatedRecord;
    use crate::enrichment::Enricher;
    use crate::normalizer::NormalizedRecord;
    use crate::registry::RegistryEntry;
    use crate::validation::Validator;

    const CNPJ_SP: &str = "11444777000161";
    const CNPJ_RJ: &str = "11222333000181";

    fn create_test_record(cnpj: &str, razao: &str, trimestre: u8, valor: &str) -> ConsolidatedRecord {
        ConsolidatedRecord {
            record: NormalizedRecord {
                cnpj_raw: cnpj.to_string(),
                razao_social: razao.to_string(),
                trimestre: trimestre.to_string(),
                ano: "2024".to_string(),
                valor_despesas: valor.to_string(),
                source_file: format!("{}T2024.csv", trimestre),
            },
            row_index: 1,
        }
    }

    fn enrich(records: Vec<ConsolidatedRecord>) -> Vec<EnrichedRecord> {
        let validator = Validator::new(&PipelineConfig::default());
        let validated = records.into_iter().map(|r| validator.validate(r)).collect();
        let registry = vec![
            RegistryEntry::new(CNPJ_SP, "1", "ACME LTDA", "Medicina de Grupo", "SP"),
            RegistryEntry::new(CNPJ_RJ, "2", "BETA SAUDE", "Cooperativa Médica", "RJ"),
        ];
        Enricher::new().enrich(validated, registry).0
    }

    fn aggregator() -> Aggregator {
        Aggregator::new(&PipelineConfig::default())
    }

    #[test]
    fn test_single_quarter_group() {
        let records = enrich(vec![create_test_record(CNPJ_SP, "ACME LTDA", 1, "500.00")]);

        let groups = aggregator().aggregate(&records);

        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.razao_social, "ACME LTDA");
        assert_eq!(group.uf, "SP");
        assert_eq!(group.total_despesas, 500.0);
        assert_eq!(group.media_despesas, 500.0);
        assert_eq!(group.desvio_padrao, 0.0);
        assert_eq!(group.coeficiente_variacao, 0.0);
        assert_eq!(group.numero_trimestres, 1);
        assert!(!group.alta_variabilidade);
        assert_eq!(group.ranking, 1);
    }

    #[test]
    fn test_negative_value_excluded_from_sum() {
        let records = enrich(vec![
            create_test_record(CNPJ_SP, "ACME LTDA", 1, "300.00"),
            create_test_record(CNPJ_SP, "ACME LTDA", 2, "-100.00"),
        ]);
        assert!(records[1].flags.contains(InconsistencyFlag::ValorNegativo));

        let groups = aggregator().aggregate(&records);

        assert_eq!(groups[0].total_despesas, 300.0);
        assert_eq!(groups[0].numero_trimestres, 1);
    }

    #[test]
    fn test_population_std_dev_and_cv() {
        let records = enrich(vec![
            create_test_record(CNPJ_SP, "ACME LTDA", 1, "100"),
            create_test_record(CNPJ_SP, "ACME LTDA", 2, "200"),
            create_test_record(CNPJ_SP, "ACME LTDA", 3, "300"),
        ]);

        let group = &aggregator().aggregate(&records)[0];

        assert_eq!(group.total_despesas, 600.0);
        assert_eq!(group.media_despesas, 200.0);
        assert_eq!(group.media_por_trimestre, 200.0);
        // sqrt(20000 / 3)
        assert!((group.desvio_padrao - 81.6496580927726).abs() < 1e-9);
        assert_eq!(group.coeficiente_variacao, 40.82);
        assert!(!group.alta_variabilidade);
    }

    #[test]
    fn test_high_variability_threshold() {
        let records = enrich(vec![
            create_test_record(CNPJ_SP, "ACME LTDA", 1, "10"),
            create_test_record(CNPJ_SP, "ACME LTDA", 2, "1000"),
        ]);

        let group = &aggregator().aggregate(&records)[0];
        assert!(group.coeficiente_variacao > 50.0);
        assert!(group.alta_variabilidade);

        let lenient = Aggregator::with_settings(AggregationSettings { cv_threshold: 200.0 });
        assert!(!lenient.aggregate(&records)[0].alta_variabilidade);
    }

    #[test]
    fn test_same_quarter_reported_twice_is_summed() {
        let records = enrich(vec![
            create_test_record(CNPJ_SP, "ACME LTDA", 1, "100"),
            create_test_record(CNPJ_SP, "ACME LTDA", 1, "50"),
            create_test_record(CNPJ_SP, "ACME LTDA", 2, "150"),
        ]);

        let group = &aggregator().aggregate(&records)[0];
        assert_eq!(group.numero_trimestres, 2);
        assert_eq!(group.total_despesas, 300.0);
        assert_eq!(group.desvio_padrao, 0.0);
    }

    #[test]
    fn test_ranking_ties_broken_by_key() {
        let records = enrich(vec![
            create_test_record(CNPJ_RJ, "BETA SAUDE", 1, "100"),
            create_test_record(CNPJ_SP, "ACME LTDA", 1, "100"),
            create_test_record("99999999000191", "ZETA", 1, "900"),
        ]);

        let groups = aggregator().aggregate(&records);
        let order: Vec<(&str, usize)> = groups
            .iter()
            .map(|g| (g.razao_social.as_str(), g.ranking))
            .collect();

        assert_eq!(order, vec![("ZETA", 1), ("ACME LTDA", 2), ("BETA SAUDE", 3)]);
        assert_eq!(groups[0].uf, PLACEHOLDER);
    }

    #[test]
    fn test_ranking_ignores_input_order() {
        let forward = vec![
            create_test_record(CNPJ_SP, "ACME LTDA", 1, "100"),
            create_test_record(CNPJ_RJ, "BETA SAUDE", 1, "100"),
        ];
        let mut backward = forward.clone();
        backward.reverse();

        let a = aggregator().aggregate(&enrich(forward));
        let b = aggregator().aggregate(&enrich(backward));
        assert_eq!(a, b);
    }

    #[test]
    fn test_blank_name_falls_back_to_registry() {
        let records = enrich(vec![
            create_test_record(CNPJ_SP, "  ", 1, "100"),
            create_test_record("99999999000191", "", 1, "50"),
        ]);

        let groups = aggregator().aggregate(&records);
        assert_eq!(groups[0].razao_social, "ACME LTDA");
        assert_eq!(groups[1].razao_social, PLACEHOLDER);
        assert_eq!(groups[1].uf, PLACEHOLDER);
    }

    #[test]
    fn test_group_with_only_excluded_values() {
        let records = enrich(vec![create_test_record(CNPJ_SP, "ACME LTDA", 1, "")]);

        let groups = aggregator().aggregate(&records);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].total_despesas, 0.0);
        assert_eq!(groups[0].numero_trimestres, 0);
        assert_eq!(groups[0].coeficiente_variacao, 0.0);
    }

    #[test]
    fn test_excluded_only_group_ties_with_zero_group() {
        let records = enrich(vec![
            create_test_record("99999999000191", "ZETA", 1, "0"),
            create_test_record("88888888000188", "ALFA", 1, ""),
        ]);

        let groups = aggregator().aggregate(&records);

        // Both totals are +0.0, so the name decides
        assert_eq!(groups[0].razao_social, "ALFA");
        assert_eq!(groups[0].ranking, 1);
        assert_eq!(groups[1].razao_social, "ZETA");
        assert!(groups[0].total_despesas.is_sign_positive());
        assert!(groups[0].media_despesas.is_sign_positive());

        let mut buf = Vec::new();
        crate::export::write_aggregated(&mut buf, &groups, &Default::default()).unwrap();
        let csv = String::from_utf8(buf).unwrap();
        assert!(csv.contains("ALFA;NÃO_INFORMADO;1;0.00;0.00;0.00;0.00;0.00;0;false"));
        assert!(!csv.contains("-0.00"));
    }

    #[test]
    fn test_summary_statistics() {
        let records = enrich(vec![
            create_test_record(CNPJ_SP, "ACME LTDA", 1, "100"),
            create_test_record(CNPJ_RJ, "BETA SAUDE", 1, "300"),
            create_test_record(CNPJ_RJ, "BETA SAUDE", 2, "500"),
        ]);

        let (groups, summary) = aggregator().run(&records);

        assert_eq!(groups.len(), 2);
        assert_eq!(summary.group_count, 2);
        assert_eq!(summary.distinct_ufs, 2);
        assert_eq!(summary.total_sum, 900.0);
        assert_eq!(summary.total_mean, 450.0);
        assert_eq!(summary.total_median, 450.0);
        assert_eq!(summary.total_min, 100.0);
        assert_eq!(summary.total_max, 800.0);
        assert_eq!(summary.total_std_dev, 350.0);
        assert_eq!(summary.top_ufs[0], ("RJ".to_string(), 800.0));
        assert_eq!(summary.top_groups[0].razao_social, "BETA SAUDE");
        // BETA: mean 400, sd 100, cv 25 → media band
        assert_eq!(summary.variability.media, 1);
        assert_eq!(summary.variability.baixa, 1);
    }

    #[test]
    fn test_empty_input() {
        let (groups, summary) = aggregator().run(&[]);
        assert!(groups.is_empty());
        assert_eq!(summary.group_count, 0);
    }
}
