//! Reference data: languages, vendors, model families and models

use super::JobDb;
use crate::config::ReferenceConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use tracing::{debug, info};

/// NLP task categories a model can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Summarization,
    Translation,
    TextGeneration,
    QuestionAnswering,
    TextClassification,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Summarization => write!(f, "summarization"),
            TaskKind::Translation => write!(f, "translation"),
            TaskKind::TextGeneration => write!(f, "text-generation"),
            TaskKind::QuestionAnswering => write!(f, "question-answering"),
            TaskKind::TextClassification => write!(f, "text-classification"),
        }
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "summarization" => Ok(TaskKind::Summarization),
            "translation" => Ok(TaskKind::Translation),
            "text-generation" => Ok(TaskKind::TextGeneration),
            "question-answering" => Ok(TaskKind::QuestionAnswering),
            "text-classification" => Ok(TaskKind::TextClassification),
            _ => Err(Error::Validation(format!("Unknown task kind: {}", s))),
        }
    }
}

/// A supported language
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Language {
    pub language_id: i64,
    pub name: String,
    pub language_tag: String,
}

/// A model together with its family, vendor and supported tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub model_id: i64,
    pub name: String,
    pub family: String,
    pub vendor: String,
    pub tasks: Vec<TaskKind>,
}

impl Model {
    pub fn supports(&self, task: TaskKind) -> bool {
        self.tasks.contains(&task)
    }
}

#[derive(FromRow)]
struct ModelRow {
    model_id: i64,
    name: String,
    family: String,
    vendor: String,
}

impl JobDb {
    /// Insert configured reference data. Existing rows are left as they are.
    pub async fn seed_reference(&self, reference: &ReferenceConfig) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        for language in &reference.languages {
            sqlx::query(
                "INSERT INTO languages (name, language_tag) VALUES (?, ?) ON CONFLICT(language_tag) DO NOTHING",
            )
            .bind(&language.name)
            .bind(&language.tag)
            .execute(&mut *tx)
            .await?;
        }

        for model in &reference.models {
            sqlx::query("INSERT INTO vendors (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
                .bind(&model.vendor)
                .execute(&mut *tx)
                .await?;
            sqlx::query("INSERT INTO model_families (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
                .bind(&model.family)
                .execute(&mut *tx)
                .await?;

            let inserted = sqlx::query(
                r#"
                INSERT INTO models (name, family_id, vendor_id)
                VALUES (
                    ?,
                    (SELECT family_id FROM model_families WHERE name = ?),
                    (SELECT vendor_id FROM vendors WHERE name = ?)
                )
                ON CONFLICT(name) DO NOTHING
                "#,
            )
            .bind(&model.name)
            .bind(&model.family)
            .bind(&model.vendor)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if inserted == 0 {
                debug!(model = %model.name, "Model already seeded");
                continue;
            }

            for task in &model.tasks {
                sqlx::query(
                    r#"
                    INSERT INTO model_tasks (model_id, task)
                    SELECT model_id, ? FROM models WHERE name = ?
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(task.to_string())
                .bind(&model.name)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        info!(
            languages = reference.languages.len(),
            models = reference.models.len(),
            "Seeded reference data"
        );
        Ok(())
    }

    /// Get a language by tag
    pub async fn get_language(&self, tag: &str) -> Result<Option<Language>> {
        let language =
            sqlx::query_as::<_, Language>("SELECT * FROM languages WHERE language_tag = ?")
                .bind(tag)
                .fetch_optional(self.pool())
                .await?;
        Ok(language)
    }

    /// List all languages
    pub async fn list_languages(&self) -> Result<Vec<Language>> {
        let languages =
            sqlx::query_as::<_, Language>("SELECT * FROM languages ORDER BY language_tag")
                .fetch_all(self.pool())
                .await?;
        Ok(languages)
    }

    /// Get a model by name
    pub async fn get_model(&self, name: &str) -> Result<Option<Model>> {
        let row = sqlx::query_as::<_, ModelRow>(
            r#"
            SELECT m.model_id, m.name, f.name AS family, v.name AS vendor
            FROM models m
            JOIN model_families f ON m.family_id = f.family_id
            JOIN vendors v ON m.vendor_id = v.vendor_id
            WHERE m.name = ?
            "#,
        )
        .bind(name)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => Ok(Some(self.load_model(row).await?)),
            None => Ok(None),
        }
    }

    /// List all models
    pub async fn list_models(&self) -> Result<Vec<Model>> {
        let rows = sqlx::query_as::<_, ModelRow>(
            r#"
            SELECT m.model_id, m.name, f.name AS family, v.name AS vendor
            FROM models m
            JOIN model_families f ON m.family_id = f.family_id
            JOIN vendors v ON m.vendor_id = v.vendor_id
            ORDER BY m.name
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        let mut models = Vec::with_capacity(rows.len());
        for row in rows {
            models.push(self.load_model(row).await?);
        }
        Ok(models)
    }

    async fn load_model(&self, row: ModelRow) -> Result<Model> {
        let tasks: Vec<String> =
            sqlx::query_scalar("SELECT task FROM model_tasks WHERE model_id = ? ORDER BY task")
                .bind(row.model_id)
                .fetch_all(self.pool())
                .await?;

        Ok(Model {
            model_id: row.model_id,
            name: row.name,
            family: row.family,
            vendor: row.vendor,
            tasks: tasks
                .iter()
                .map(|t| t.parse())
                .collect::<Result<Vec<TaskKind>>>()?,
        })
    }

    /// Check that a summarization request names a known language and a
    /// model able to summarize
    pub async fn validate_summary_target(&self, model: &str, language: &str) -> Result<()> {
        if self.get_language(language).await?.is_none() {
            return Err(Error::Validation(format!(
                "unsupported language '{}'",
                language
            )));
        }

        match self.get_model(model).await? {
            None => Err(Error::Validation(format!("unknown model '{}'", model))),
            Some(m) if !m.supports(TaskKind::Summarization) => Err(Error::Validation(format!(
                "model '{}' does not support summarization",
                model
            ))),
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LanguageSeed, ModelSeed};
    use crate::meta::testing::setup_dbs;

    #[test]
    fn test_task_kind_parse() {
        assert_eq!(
            "text-generation".parse::<TaskKind>().unwrap(),
            TaskKind::TextGeneration
        );
        assert_eq!(TaskKind::QuestionAnswering.to_string(), "question-answering");
        assert!("painting".parse::<TaskKind>().is_err());
    }

    #[tokio::test]
    async fn test_seeded_defaults() {
        let (db, _files, _config, _tmp) = setup_dbs().await;

        let english = db.get_language("en").await.unwrap().unwrap();
        assert_eq!(english.name, "English");

        let model = db.get_model("t5-large").await.unwrap().unwrap();
        assert_eq!(model.family, "T5");
        assert_eq!(model.vendor, "Google");
        assert!(model.supports(TaskKind::Summarization));
        assert!(model.supports(TaskKind::Translation));
        assert!(!model.supports(TaskKind::TextGeneration));
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let (db, _files, mut config, _tmp) = setup_dbs().await;

        config.reference.languages.push(LanguageSeed {
            tag: "es".to_string(),
            name: "Spanish".to_string(),
        });
        config.reference.models.push(ModelSeed {
            name: "gpt-small".to_string(),
            family: "GPT".to_string(),
            vendor: "OpenAI".to_string(),
            tasks: vec![TaskKind::TextGeneration],
        });

        db.seed_reference(&config.reference).await.unwrap();
        db.seed_reference(&config.reference).await.unwrap();

        assert_eq!(db.list_languages().await.unwrap().len(), 2);
        assert_eq!(db.list_models().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_validate_summary_target() {
        let (db, _files, mut config, _tmp) = setup_dbs().await;
        config.reference.models.push(ModelSeed {
            name: "gpt-small".to_string(),
            family: "GPT".to_string(),
            vendor: "OpenAI".to_string(),
            tasks: vec![TaskKind::TextGeneration],
        });
        db.seed_reference(&config.reference).await.unwrap();

        assert!(db.validate_summary_target("t5-large", "en").await.is_ok());
        assert!(matches!(
            db.validate_summary_target("t5-large", "xx").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            db.validate_summary_target("missing", "en").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            db.validate_summary_target("gpt-small", "en").await,
            Err(Error::Validation(_))
        ));
    }
}
