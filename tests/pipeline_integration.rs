// End-to-end runs over fixture files written to a temp directory

use ans_despesas::{
    discover_sources, load_registry, select_recent_periods, FileStatus, InconsistencyFlag,
    JoinStatus, Period, Pipeline, PipelineConfig, PipelineError, SourceFile,
};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const REGISTRY: &str = "Registro_ANS;CNPJ;Razao_Social;Modalidade;UF;Data_Registro_ANS\n\
    100001;11444777000161;ACME SAUDE LTDA;Medicina de Grupo;SP;2001-03-15\n\
    100002;11222333000181;BETA COOPERATIVA;Cooperativa Médica;RJ;15/07/1999\n\
    100003;11444777000161;ACME DUPLICADA;Autogestão;MG;2010-01-01\n\
    100004;123;REGISTRO CURTO;Autogestão;BA;\n";

fn write(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn write_quarter(dir: &Path, name: &str, trimestre: u8, acme: &str, beta: &str) {
    let content = format!(
        "CNPJ;Razão Social;Trimestre;Ano;Valor Despesas\n\
         11.444.777/0001-61;ACME SAUDE LTDA;{t};2024;{acme}\n\
         11222333000181;BETA COOPERATIVA;{t};2024;{beta}\n",
        t = trimestre,
        acme = acme,
        beta = beta
    );
    write(dir, name, content.as_bytes());
}

#[test]
fn test_full_run_over_three_recent_quarters() {
    let input = TempDir::new().unwrap();
    // Oldest period is ignored: only the 3 most recent are consolidated
    write_quarter(input.path(), "4T2023.csv", 4, "999.999,00", "1,00");
    write_quarter(input.path(), "1T2024.csv", 1, "1.000,00", "500,00");
    write_quarter(input.path(), "2T2024.csv", 2, "2.000,00", "-50,00");
    write_quarter(input.path(), "2024_3T.csv", 3, "3.000,00", "500,00");
    let registry_path = write(input.path(), "operadoras.csv", REGISTRY.as_bytes());

    let config = PipelineConfig::default();
    let sources = select_recent_periods(discover_sources(input.path()).unwrap(), 3);
    let periods: Vec<Period> = sources.iter().filter_map(|s| s.period).collect();
    assert_eq!(
        periods,
        vec![Period::new(2024, 1), Period::new(2024, 2), Period::new(2024, 3)]
    );

    let registry = load_registry(&registry_path, &config).unwrap();
    assert_eq!(registry.discarded_invalid, 1);

    let output = Pipeline::new(config.clone()).run(&sources, registry).unwrap();

    // Row-count conservation through every stage
    assert_eq!(output.report.ingestion.rows_read, 6);
    assert_eq!(output.report.validation.total_records, 6);
    assert_eq!(output.records.len(), 6);
    assert_eq!(output.report.validation.count(InconsistencyFlag::ValorNegativo), 1);

    // Registry duplicate dropped, first entry wins
    assert_eq!(output.report.enrichment.duplicates_removed_count, 1);
    assert!(output
        .records
        .iter()
        .all(|r| r.join_status == JoinStatus::Matched));
    assert!(output
        .records
        .iter()
        .filter(|r| r.cnpj() == "11444777000161")
        .all(|r| r.uf.as_deref() == Some("SP")));

    // ACME: 1000, 2000, 3000 → mean 2000, sd 816.50, cv 40.82
    let acme = &output.groups[0];
    assert_eq!(acme.razao_social, "ACME SAUDE LTDA");
    assert_eq!(acme.uf, "SP");
    assert_eq!(acme.ranking, 1);
    assert_eq!(acme.total_despesas, 6000.0);
    assert_eq!(acme.numero_trimestres, 3);
    assert_eq!(acme.coeficiente_variacao, 40.82);

    // BETA: negative quarter excluded → 500, 500
    let beta = &output.groups[1];
    assert_eq!(beta.razao_social, "BETA COOPERATIVA");
    assert_eq!(beta.uf, "RJ");
    assert_eq!(beta.ranking, 2);
    assert_eq!(beta.total_despesas, 1000.0);
    assert_eq!(beta.numero_trimestres, 2);
    assert_eq!(beta.desvio_padrao, 0.0);

    let out_dir = input.path().join("out");
    let files = output.write_to(&out_dir, &config).unwrap();

    let consolidated = fs::read_to_string(&files.consolidated).unwrap();
    assert_eq!(consolidated.lines().count(), 7);
    assert!(consolidated.contains("11222333000181;BETA COOPERATIVA;2;2024;-50.00;VALOR_NEGATIVO"));

    let aggregated = fs::read_to_string(&files.aggregated).unwrap();
    let lines: Vec<&str> = aggregated.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("ACME SAUDE LTDA;SP;1;6000.00;2000.00;2000.00;816.50;40.82;3;"));

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&files.report).unwrap()).unwrap();
    assert_eq!(report["enrichment"]["duplicates_removed_count"], 1);
    assert_eq!(report["validation"]["flag_counts"]["VALOR_NEGATIVO"], 1);
}

#[test]
fn test_bad_file_is_skipped_not_fatal() {
    let input = TempDir::new().unwrap();
    write_quarter(input.path(), "1T2024.csv", 1, "100", "200");
    let broken = write(input.path(), "2T2024.csv", b"foo;bar;baz\n1;2;3\n");

    let sources = vec![
        SourceFile::new(input.path().join("1T2024.csv")),
        SourceFile::new(broken),
    ];
    let output = Pipeline::new(PipelineConfig::default())
        .run(&sources, Default::default())
        .unwrap();

    let ingestion = &output.report.ingestion;
    assert_eq!(ingestion.files_loaded(), 1);
    assert_eq!(ingestion.files_skipped(), 1);
    assert!(matches!(ingestion.files[1].status, FileStatus::Skipped { .. }));
    assert_eq!(ingestion.rows_per_file()[0], ("1T2024.csv".to_string(), 2));

    // Empty registry: everything unmatched, nothing dropped
    assert_eq!(output.records.len(), 2);
    assert!(output
        .records
        .iter()
        .all(|r| r.flags.contains(InconsistencyFlag::CnpjSemMatch)));
    assert!(output.groups.iter().all(|g| g.uf == "NÃO_INFORMADO"));
}

#[test]
fn test_only_unusable_files_is_fatal() {
    let input = TempDir::new().unwrap();
    let a = write(input.path(), "a.csv", b"x;y\n1;2\n");
    let b = write(input.path(), "b.csv", b"");

    let err = Pipeline::new(PipelineConfig::default())
        .run(&[SourceFile::new(a), SourceFile::new(b)], Default::default())
        .unwrap_err();

    assert!(matches!(err, PipelineError::NoUsableInput { files_attempted: 2 }));
}

#[test]
fn test_latin1_and_fixed_width_sources() {
    let input = TempDir::new().unwrap();

    // "SAÚDE" in Latin-1, comma separated, header spellings from the alias table
    let mut latin1 = b"cd_cnpj,nm_razao_social,nr_trimestre,ano_competencia,vl_despesa\n".to_vec();
    latin1.extend_from_slice(b"11444777000161,ACME SA\xDADE,1,2024,10.5\n");
    let latin1_path = write(input.path(), "latin1.csv", &latin1);

    let fixed = "CNPJ            RAZAO_SOCIAL    TRIMESTRE  ANO   VALOR\n\
                 11222333000181  BETA            1          2024  20,00\n";
    let fixed_path = write(input.path(), "fixo.txt", fixed.as_bytes());

    let output = Pipeline::new(PipelineConfig::default())
        .run(
            &[SourceFile::new(latin1_path), SourceFile::new(fixed_path)],
            Default::default(),
        )
        .unwrap();

    assert_eq!(output.report.ingestion.files_loaded(), 2);
    assert_eq!(output.records[0].validated.razao_social, "ACME SAÚDE");
    assert_eq!(output.records[0].validated.valor_despesas, Some(10.5));
    assert_eq!(output.records[1].validated.razao_social, "BETA");
    assert_eq!(output.records[1].validated.valor_despesas, Some(20.0));
    assert!(output.records[1].validated.flags.is_empty());
}

#[test]
fn test_declared_period_fills_missing_columns() {
    let input = TempDir::new().unwrap();
    let path = write(
        input.path(),
        "despesas.csv",
        b"cnpj;razao_social;valor_despesas\n11444777000161;ACME;300\n",
    );

    let source = SourceFile::new(path).with_period(Period::new(2024, 4));
    let output = Pipeline::new(PipelineConfig::default())
        .run(&[source], Default::default())
        .unwrap();

    let record = &output.records[0].validated;
    assert_eq!(record.trimestre, Some(4));
    assert_eq!(record.ano, Some(2024));
    assert!(!record.flags.contains(InconsistencyFlag::TrimestreInvalido));
}

#[test]
fn test_config_file_extends_aliases() {
    let input = TempDir::new().unwrap();
    let config_path = write(
        input.path(),
        "pipeline.toml",
        b"[aliases]\nvalor_despesas = [\"gasto_total\"]\n\n[aggregation]\ncv_threshold = 10.0\n",
    );
    let config = PipelineConfig::from_file(&config_path).unwrap();
    assert_eq!(config.aggregation.cv_threshold, 10.0);

    let path = write(
        input.path(),
        "1T2024.csv",
        b"cnpj;razao_social;trimestre;ano;gasto_total\n\
          11444777000161;ACME;1;2024;100\n\
          11444777000161;ACME;2;2024;200\n",
    );
    let output = Pipeline::new(config)
        .run(&[SourceFile::new(path)], Default::default())
        .unwrap();

    // cv 33.33 > 10
    assert!(output.groups[0].alta_variabilidade);
    assert_eq!(output.groups[0].coeficiente_variacao, 33.33);
}

#[test]
fn test_zipped_accounting_file_resolved_through_registry() {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let input = TempDir::new().unwrap();
    let registry_path = write(input.path(), "operadoras.csv", REGISTRY.as_bytes());

    let archive_path = input.path().join("1T2024.zip");
    let mut archive = zip::ZipWriter::new(fs::File::create(&archive_path).unwrap());
    archive
        .start_file("1T2024_contabil.csv", SimpleFileOptions::default())
        .unwrap();
    archive
        .write_all(
            "REG_ANS;CD_CONTA_CONTABIL;DESCRICAO;VL_SALDO_FINAL\n\
             100001;41;EVENTOS/ SINISTROS CONHECIDOS;1.000,00\n\
             100001;31;CONTRAPRESTAÇÕES EFETIVAS;5.000,00\n\
             100002;41;Sinistros conhecidos;300,00\n"
                .as_bytes(),
        )
        .unwrap();
    archive.finish().unwrap();

    let config = PipelineConfig::default();
    let sources = discover_sources(input.path()).unwrap();
    assert_eq!(sources.len(), 2);
    let sources = select_recent_periods(sources, 3);
    assert_eq!(sources.len(), 1);

    let registry = load_registry(&registry_path, &config).unwrap();
    let output = Pipeline::new(config).run(&sources, registry).unwrap();

    let file = &output.report.ingestion.files[0];
    assert!(file.path.ends_with("1T2024_contabil.csv"));
    assert_eq!(file.rows_read, 2);
    assert_eq!(file.rows_filtered, 1);

    assert_eq!(output.records.len(), 2);
    assert!(output
        .records
        .iter()
        .all(|r| r.join_status == JoinStatus::Matched));
    assert_eq!(output.groups[0].razao_social, "ACME SAUDE LTDA");
    assert_eq!(output.groups[0].total_despesas, 1000.0);
    assert_eq!(output.groups[1].razao_social, "BETA COOPERATIVA");
    assert_eq!(output.records[0].validated.trimestre, Some(1));
    assert_eq!(output.records[0].validated.ano, Some(2024));
}
