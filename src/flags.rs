// 🚩 Inconsistency flags
// A record carries a SET of flags; flags annotate, they never remove records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InconsistencyFlag {
    CnpjInvalido,
    CnpjSemMatch,
    RazaoVazia,
    ValorNulo,
    ValorNegativo,
    ValorZerado,
    TrimestreInvalido,
    AnoInvalido,
}

impl InconsistencyFlag {
    pub const ALL: [InconsistencyFlag; 8] = [
        InconsistencyFlag::CnpjInvalido,
        InconsistencyFlag::CnpjSemMatch,
        InconsistencyFlag::RazaoVazia,
        InconsistencyFlag::ValorNulo,
        InconsistencyFlag::ValorNegativo,
        InconsistencyFlag::ValorZerado,
        InconsistencyFlag::TrimestreInvalido,
        InconsistencyFlag::AnoInvalido,
    ];

    /// Code written to the output files
    pub fn code(&self) -> &'static str {
        match self {
            InconsistencyFlag::CnpjInvalido => "CNPJ_INVALIDO",
            InconsistencyFlag::CnpjSemMatch => "CNPJ_SEM_MATCH",
            InconsistencyFlag::RazaoVazia => "RAZAO_VAZIA",
            InconsistencyFlag::ValorNulo => "VALOR_NULO",
            InconsistencyFlag::ValorNegativo => "VALOR_NEGATIVO",
            InconsistencyFlag::ValorZerado => "VALOR_ZERADO",
            InconsistencyFlag::TrimestreInvalido => "TRIMESTRE_INVALIDO",
            InconsistencyFlag::AnoInvalido => "ANO_INVALIDO",
        }
    }

    /// Values in this state are left out of group sums
    pub fn excludes_value(&self) -> bool {
        matches!(
            self,
            InconsistencyFlag::ValorNulo | InconsistencyFlag::ValorNegativo
        )
    }
}

impl fmt::Display for InconsistencyFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Ordered set of flags attached to one record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSet(BTreeSet<InconsistencyFlag>);

impl FlagSet {
    pub fn new() -> Self {
        FlagSet(BTreeSet::new())
    }

    pub fn insert(&mut self, flag: InconsistencyFlag) {
        self.0.insert(flag);
    }

    /// Builder style insert, used when a later stage carries flags forward
    pub fn with(mut self, flag: InconsistencyFlag) -> Self {
        self.0.insert(flag);
        self
    }

    pub fn contains(&self, flag: InconsistencyFlag) -> bool {
        self.0.contains(&flag)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = InconsistencyFlag> + '_ {
        self.0.iter().copied()
    }

    /// Pipe-separated codes, empty string when no flag is set
    pub fn to_field(&self) -> String {
        self.0
            .iter()
            .map(|f| f.code())
            .collect::<Vec<_>>()
            .join("|")
    }
}

impl FromIterator<InconsistencyFlag> for FlagSet {
    fn from_iter<I: IntoIterator<Item = InconsistencyFlag>>(iter: I) -> Self {
        FlagSet(iter.into_iter().collect())
    }
}
