use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub main_table: String,
    pub primary_key: String,
    /// Chunked sequence store, as `table,chrCol,startCol,seqCol,chunkSize`.
    #[serde(default)]
    pub sequence_store: Option<String>,
}

impl Dataset {
    pub fn new(
        name: impl Into<String>,
        main_table: impl Into<String>,
        primary_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            main_table: main_table.into(),
            primary_key: primary_key.into(),
            sequence_store: None,
        }
    }

    pub fn with_sequence_store(mut self, spec: impl Into<String>) -> Self {
        self.sequence_store = Some(spec.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub field: String,
    pub table: String,
    #[serde(default)]
    pub key: Option<String>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, field: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
            table: table.into(),
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn qualified(&self) -> String {
        format!("{}.{}", self.table, self.field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    IsNull,
    NotNull,
}

impl Operator {
    pub fn sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Like => "LIKE",
            Operator::IsNull => "IS NULL",
            Operator::NotNull => "IS NOT NULL",
        }
    }

    pub fn takes_value(self) -> bool {
        !matches!(self, Operator::IsNull | Operator::NotNull)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicFilter {
    pub field: String,
    pub table: String,
    #[serde(default)]
    pub key: Option<String>,
    pub operator: Operator,
    #[serde(default)]
    pub value: Option<String>,
}

impl BasicFilter {
    pub fn new(
        field: impl Into<String>,
        table: impl Into<String>,
        operator: Operator,
        value: Option<String>,
    ) -> Self {
        Self {
            field: field.into(),
            table: table.into(),
            key: None,
            operator,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdSource {
    Values(Vec<String>),
    /// Resolved by running the query to completion and collecting its first column.
    SubQuery(Box<Query>),
    /// `http(s)://`, `file://` or a plain path; one identifier per line.
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdListFilter {
    pub field: String,
    pub table: String,
    #[serde(default)]
    pub key: Option<String>,
    pub source: IdSource,
}

impl IdListFilter {
    pub fn new(field: impl Into<String>, table: impl Into<String>, source: IdSource) -> Self {
        Self {
            field: field.into(),
            table: table.into(),
            key: None,
            source,
        }
    }

    pub fn from_values<I, S>(field: impl Into<String>, table: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            field,
            table,
            IdSource::Values(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn values(&self) -> Option<&[String]> {
        match &self.source {
            IdSource::Values(values) => Some(values),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.values().is_some()
    }

    pub fn with_values(&self, values: Vec<String>) -> Self {
        Self {
            field: self.field.clone(),
            table: self.table.clone(),
            key: self.key.clone(),
            source: IdSource::Values(values),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    Basic(BasicFilter),
    IdList(IdListFilter),
}

impl Filter {
    pub fn table(&self) -> &str {
        match self {
            Filter::Basic(filter) => &filter.table,
            Filter::IdList(filter) => &filter.table,
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Filter::Basic(filter) => &filter.field,
            Filter::IdList(filter) => &filter.field,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            Filter::Basic(filter) => filter.key.as_deref(),
            Filter::IdList(filter) => filter.key.as_deref(),
        }
    }

    pub fn qualified(&self) -> String {
        format!("{}.{}", self.table(), self.field())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructureFields {
    pub gene_key: String,
    pub transcript_key: String,
    pub snp_key: String,
    pub protein_key: String,
    pub rank: String,
    pub chromosome: String,
    pub exon_start: String,
    pub exon_end: String,
    pub coding_start: String,
    pub coding_end: String,
    pub strand: String,
    pub snp_start: String,
    pub allele: String,
    pub protein_sequence: String,
}

impl Default for StructureFields {
    fn default() -> Self {
        Self {
            gene_key: "gene_id_key".to_string(),
            transcript_key: "transcript_id_key".to_string(),
            snp_key: "snp_id_key".to_string(),
            protein_key: "translation_id_key".to_string(),
            rank: "rank".to_string(),
            chromosome: "chr_name".to_string(),
            exon_start: "exon_chrom_start".to_string(),
            exon_end: "exon_chrom_end".to_string(),
            coding_start: "coding_start".to_string(),
            coding_end: "coding_end".to_string(),
            strand: "exon_chrom_strand".to_string(),
            snp_start: "snp_chrom_start".to_string(),
            allele: "allele".to_string(),
            protein_sequence: "protein_sequence".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureSchema {
    pub table: String,
    #[serde(default)]
    pub fields: StructureFields,
}

impl StructureSchema {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: StructureFields::default(),
        }
    }
}

/// Joins a reference dataset, which the caller's filters apply to, onto the structure
/// table that holds sequence coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetLink {
    pub reference: Dataset,
    pub exportable: Attribute,
    pub importable: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceDescription {
    pub seq_type: String,
    #[serde(default)]
    pub left_flank: u64,
    #[serde(default)]
    pub right_flank: u64,
    pub structure: StructureSchema,
    #[serde(default)]
    pub link: Option<DatasetLink>,
}

impl SequenceDescription {
    pub fn new(seq_type: impl Into<String>, structure: StructureSchema) -> Self {
        Self {
            seq_type: seq_type.into(),
            left_flank: 0,
            right_flank: 0,
            structure,
            link: None,
        }
    }

    pub fn with_flanks(mut self, left: u64, right: u64) -> Self {
        self.left_flank = left;
        self.right_flank = right;
        self
    }

    pub fn with_link(mut self, link: DatasetLink) -> Self {
        self.link = Some(link);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Attribute,
    Sequence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    dataset: Dataset,
    #[serde(default)]
    attributes: Vec<Attribute>,
    #[serde(default)]
    filters: Vec<Filter>,
    #[serde(default)]
    sort_by: Vec<Attribute>,
    #[serde(default)]
    limit: usize,
    #[serde(default)]
    sequence: Option<SequenceDescription>,
}

impl Query {
    pub fn new(dataset: Dataset) -> Self {
        Self {
            dataset,
            attributes: Vec::new(),
            filters: Vec::new(),
            sort_by: Vec::new(),
            limit: 0,
            sequence: None,
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn set_dataset(&mut self, dataset: Dataset) {
        self.dataset = dataset;
    }

    pub fn query_type(&self) -> QueryType {
        if self.sequence.is_some() {
            QueryType::Sequence
        } else {
            QueryType::Attribute
        }
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn add_attribute(&mut self, attribute: Attribute) -> bool {
        if self.attributes.contains(&attribute) {
            return false;
        }
        self.attributes.push(attribute);
        true
    }

    pub fn remove_attribute(&mut self, attribute: &Attribute) -> bool {
        let before = self.attributes.len();
        self.attributes.retain(|existing| existing != attribute);
        before != self.attributes.len()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn add_filter(&mut self, filter: Filter) -> bool {
        if self.filters.contains(&filter) {
            return false;
        }
        self.filters.push(filter);
        true
    }

    pub fn remove_filter(&mut self, filter: &Filter) -> bool {
        let before = self.filters.len();
        self.filters.retain(|existing| existing != filter);
        before != self.filters.len()
    }

    /// Swaps `old` for `new` in place, keeping filter order.
    pub fn replace_filter(&mut self, old: &Filter, new: Filter) -> bool {
        match self.filters.iter().position(|existing| existing == old) {
            Some(index) => {
                self.filters[index] = new;
                true
            }
            None => false,
        }
    }

    pub fn sort_by(&self) -> &[Attribute] {
        &self.sort_by
    }

    pub fn add_sort(&mut self, attribute: Attribute) -> bool {
        if self.sort_by.contains(&attribute) {
            return false;
        }
        self.sort_by.push(attribute);
        true
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub fn sequence(&self) -> Option<&SequenceDescription> {
        self.sequence.as_ref()
    }

    pub fn set_sequence(&mut self, sequence: Option<SequenceDescription>) {
        self.sequence = sequence;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gene_dataset() -> Dataset {
        Dataset::new("gene", "gene_main", "gene_id_key")
    }

    #[test]
    fn duplicate_filters_are_rejected() {
        let mut query = Query::new(gene_dataset());
        let filter = Filter::Basic(BasicFilter::new(
            "biotype",
            "gene_main",
            Operator::Eq,
            Some("protein_coding".to_string()),
        ));
        assert!(query.add_filter(filter.clone()));
        assert!(!query.add_filter(filter.clone()));
        assert_eq!(query.filters().len(), 1);
        assert!(query.remove_filter(&filter));
        assert!(query.filters().is_empty());
    }

    #[test]
    fn query_type_follows_sequence_description() {
        let mut query = Query::new(gene_dataset());
        assert_eq!(query.query_type(), QueryType::Attribute);
        query.set_sequence(Some(SequenceDescription::new(
            "peptide",
            StructureSchema::new("structure"),
        )));
        assert_eq!(query.query_type(), QueryType::Sequence);
    }

    #[test]
    fn query_round_trips_through_json() {
        let json = r#"{
            "dataset": {"name": "gene", "main_table": "gene_main", "primary_key": "gene_id_key"},
            "attributes": [{"name": "id", "field": "gene_stable_id", "table": "gene_main"}],
            "filters": [
                {"type": "basic", "field": "biotype", "table": "gene_main", "operator": "eq", "value": "lncRNA"},
                {"type": "id_list", "field": "gene_stable_id", "table": "gene_main", "source": {"values": ["G1", "G2"]}}
            ],
            "sequence": {"seq_type": "cdna", "structure": {"table": "structure"}}
        }"#;
        let query: Query = serde_json::from_str(json).unwrap();
        assert_eq!(query.attributes().len(), 1);
        assert_eq!(query.filters().len(), 2);
        let Filter::IdList(list) = &query.filters()[1] else {
            panic!("expected id list filter");
        };
        assert_eq!(list.values().map(<[String]>::len), Some(2));
        let description = query.sequence().unwrap();
        assert_eq!(description.structure.fields.rank, "rank");
        assert_eq!(description.left_flank, 0);
    }
}
