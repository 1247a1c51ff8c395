//! Database store for the user ledger, delegations and questionnaires
//!
//! Lifecycle operations run their reads and writes inside a single
//! transaction obtained from [`Store::begin`]; a crash can never leave a
//! credit debit without its matching delegation mutation. Capacity racing is
//! resolved by the conditional receiver update, not by in-process locking.

use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::lifecycle::LifecycleError;
use crate::models::{
    Delegation, DelegationPreview, DelegationState, Question, Questionnaire,
    QuestionnaireDefinition, User,
};

/// Database store
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// A transaction covering one lifecycle operation
pub type StoreTx = Transaction<'static, Sqlite>;

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn begin(&self) -> Result<StoreTx> {
        let mut tx = self.pool.begin().await?;
        // The pool opens deferred transactions; two operations that upgrade
        // to the write lock midway deadlock each other. Take the write lock
        // up front so concurrent operations queue on the busy timeout
        // instead.
        sqlx::query("UPDATE users SET credit = credit WHERE open_id = ''")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    // User ledger

    pub async fn create_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (open_id, name, student_num, credit)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&user.open_id)
        .bind(&user.name)
        .bind(&user.student_number)
        .bind(user.credit)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_user(&self, open_id: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT open_id, name, student_num, credit
            FROM users
            WHERE open_id = ?
            "#,
        )
        .bind(open_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(User::from))
    }

    pub async fn get_user_by_student_number(&self, student_number: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT open_id, name, student_num, credit
            FROM users
            WHERE student_num = ?
            "#,
        )
        .bind(student_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(User::from))
    }

    /// Load a user inside a lifecycle transaction
    pub async fn user_in_tx(&self, tx: &mut StoreTx, open_id: &str) -> Result<User> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT open_id, name, student_num, credit
            FROM users
            WHERE open_id = ?
            "#,
        )
        .bind(open_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::NotFound("no_such_user".to_string()))?;

        Ok(User::from(row))
    }

    /// Set a user's credit balance; callers compute new = old +/- delta and
    /// must have validated it stays non-negative
    pub async fn set_credit(&self, tx: &mut StoreTx, open_id: &str, new_credit: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE users SET credit = ? WHERE open_id = ?
            "#,
        )
        .bind(new_credit)
        .bind(open_id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("no_such_user".to_string()));
        }

        Ok(())
    }

    // Delegation operations

    pub async fn insert_delegation(&self, tx: &mut StoreTx, delegation: &Delegation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delegations
                (id, publisher, name, description, reward, start_time, deadline,
                 delegation_type, questionnaire_id, max_number, current_number, state)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&delegation.id)
        .bind(&delegation.publisher)
        .bind(&delegation.name)
        .bind(&delegation.description)
        .bind(delegation.reward)
        .bind(delegation.start_time)
        .bind(delegation.deadline)
        .bind(&delegation.delegation_type)
        .bind(&delegation.questionnaire_id)
        .bind(delegation.max_number)
        .bind(delegation.current_number)
        .bind(delegation.state.code())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn get_delegation(&self, id: &str) -> Result<Delegation> {
        let row = sqlx::query_as::<_, DelegationRow>(
            r#"
            SELECT id, publisher, name, description, reward, start_time, deadline,
                   delegation_type, questionnaire_id, max_number, current_number, state
            FROM delegations
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("no_such_delegation".to_string()))?;

        let receivers = sqlx::query_scalar::<_, String>(
            r#"
            SELECT receiver_id FROM delegation_receivers WHERE delegation_id = ?
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        row.into_delegation(receivers)
    }

    /// Load a delegation and its receiver set inside a lifecycle transaction
    pub async fn delegation_in_tx(&self, tx: &mut StoreTx, id: &str) -> Result<Delegation> {
        let row = sqlx::query_as::<_, DelegationRow>(
            r#"
            SELECT id, publisher, name, description, reward, start_time, deadline,
                   delegation_type, questionnaire_id, max_number, current_number, state
            FROM delegations
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::NotFound("no_such_delegation".to_string()))?;

        let receivers = sqlx::query_scalar::<_, String>(
            r#"
            SELECT receiver_id FROM delegation_receivers WHERE delegation_id = ?
            "#,
        )
        .bind(id)
        .fetch_all(&mut **tx)
        .await?;

        row.into_delegation(receivers)
    }

    pub async fn set_state(&self, tx: &mut StoreTx, id: &str, state: DelegationState) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE delegations SET state = ? WHERE id = ?
            "#,
        )
        .bind(state.code())
        .bind(id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("no_such_delegation".to_string()));
        }

        Ok(())
    }

    /// Atomically append a receiver: increments occupancy and flips the state
    /// to Accepted when the last slot fills, guarded so that two calls racing
    /// for one remaining slot serialize into one success and one
    /// `CapacityExceeded`.
    pub async fn add_receiver(&self, tx: &mut StoreTx, id: &str, receiver_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE delegations
            SET current_number = current_number + 1,
                state = CASE WHEN current_number + 1 >= max_number THEN 1 ELSE 0 END
            WHERE id = ? AND state = 0 AND current_number < max_number
            "#,
        )
        .bind(id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Rule(LifecycleError::CapacityExceeded));
        }

        sqlx::query(
            r#"
            INSERT INTO delegation_receivers (delegation_id, receiver_id)
            VALUES (?, ?)
            "#,
        )
        .bind(id)
        .bind(receiver_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                AppError::Rule(LifecycleError::AlreadyReceived)
            }
            other => AppError::Database(other),
        })?;

        Ok(())
    }

    /// Atomically remove a receiver: decrements occupancy, optionally shrinks
    /// the capacity counter (a settled slot does not reopen), and sets the
    /// new state in the same operation.
    pub async fn remove_receiver(
        &self,
        tx: &mut StoreTx,
        id: &str,
        receiver_id: &str,
        new_state: DelegationState,
        shrink_capacity: bool,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM delegation_receivers
            WHERE delegation_id = ? AND receiver_id = ?
            "#,
        )
        .bind(id)
        .bind(receiver_id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("no_such_receiver".to_string()));
        }

        let max_delta = if shrink_capacity { 1 } else { 0 };
        sqlx::query(
            r#"
            UPDATE delegations
            SET current_number = current_number - 1,
                max_number = max_number - ?,
                state = ?
            WHERE id = ?
            "#,
        )
        .bind(max_delta)
        .bind(new_state.code())
        .bind(id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Remove every receiver and zero occupancy (publisher cancel)
    pub async fn clear_receivers(
        &self,
        tx: &mut StoreTx,
        id: &str,
        new_state: DelegationState,
    ) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM delegation_receivers WHERE delegation_id = ?
            "#,
        )
        .bind(id)
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE delegations SET current_number = 0, state = ? WHERE id = ?
            "#,
        )
        .bind(new_state.code())
        .bind(id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    // Paginated queries; page and limit are 1-based and validated upstream

    pub async fn list_open(
        &self,
        page: i64,
        limit: i64,
        now: i64,
    ) -> Result<(Vec<DelegationPreview>, i64)> {
        let rows = sqlx::query_as::<_, PreviewRow>(
            r#"
            SELECT id, name, description, reward, deadline
            FROM delegations
            WHERE state = 0 AND deadline > ?
            ORDER BY start_time DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .bind((page - 1) * limit)
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM delegations WHERE state = 0 AND deadline > ?
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok((rows.into_iter().map(DelegationPreview::from).collect(), total))
    }

    pub async fn list_by_state(
        &self,
        state: DelegationState,
        page: i64,
        limit: i64,
    ) -> Result<(Vec<DelegationPreview>, i64)> {
        let rows = sqlx::query_as::<_, PreviewRow>(
            r#"
            SELECT id, name, description, reward, deadline
            FROM delegations
            WHERE state = ?
            ORDER BY start_time DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(state.code())
        .bind(limit)
        .bind((page - 1) * limit)
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM delegations WHERE state = ?
            "#,
        )
        .bind(state.code())
        .fetch_one(&self.pool)
        .await?;

        Ok((rows.into_iter().map(DelegationPreview::from).collect(), total))
    }

    pub async fn list_by_publisher(
        &self,
        publisher: &str,
        page: i64,
        limit: i64,
    ) -> Result<(Vec<DelegationPreview>, i64)> {
        let rows = sqlx::query_as::<_, PreviewRow>(
            r#"
            SELECT id, name, description, reward, deadline
            FROM delegations
            WHERE publisher = ?
            ORDER BY start_time DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(publisher)
        .bind(limit)
        .bind((page - 1) * limit)
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM delegations WHERE publisher = ?
            "#,
        )
        .bind(publisher)
        .fetch_one(&self.pool)
        .await?;

        Ok((rows.into_iter().map(DelegationPreview::from).collect(), total))
    }

    pub async fn list_by_receiver(
        &self,
        receiver: &str,
        page: i64,
        limit: i64,
    ) -> Result<(Vec<DelegationPreview>, i64)> {
        let rows = sqlx::query_as::<_, PreviewRow>(
            r#"
            SELECT d.id, d.name, d.description, d.reward, d.deadline
            FROM delegations d
            JOIN delegation_receivers r ON r.delegation_id = d.id
            WHERE r.receiver_id = ?
            ORDER BY d.start_time DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(receiver)
        .bind(limit)
        .bind((page - 1) * limit)
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM delegation_receivers
            WHERE receiver_id = ?
            "#,
        )
        .bind(receiver)
        .fetch_one(&self.pool)
        .await?;

        Ok((rows.into_iter().map(DelegationPreview::from).collect(), total))
    }

    // Questionnaire operations

    pub async fn create_questionnaire(
        &self,
        tx: &mut StoreTx,
        definition: &QuestionnaireDefinition,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let questions = serde_json::to_string(&definition.questions)
            .map_err(|e| AppError::Internal(format!("Failed to encode questions: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO questionnaires (id, title, questions)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&definition.title)
        .bind(questions)
        .execute(&mut **tx)
        .await?;

        Ok(id)
    }

    pub async fn get_questionnaire(&self, id: &str) -> Result<Questionnaire> {
        let row = sqlx::query_as::<_, QuestionnaireRow>(
            r#"
            SELECT id, title, questions FROM questionnaires WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("no_such_questionnaire".to_string()))?;

        row.try_into()
    }

    pub async fn questionnaire_in_tx(&self, tx: &mut StoreTx, id: &str) -> Result<Questionnaire> {
        let row = sqlx::query_as::<_, QuestionnaireRow>(
            r#"
            SELECT id, title, questions FROM questionnaires WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::NotFound("no_such_questionnaire".to_string()))?;

        row.try_into()
    }

    pub async fn update_questionnaire_questions(
        &self,
        tx: &mut StoreTx,
        id: &str,
        questions: &[Question],
    ) -> Result<()> {
        let encoded = serde_json::to_string(questions)
            .map_err(|e| AppError::Internal(format!("Failed to encode questions: {}", e)))?;

        let result = sqlx::query(
            r#"
            UPDATE questionnaires SET questions = ? WHERE id = ?
            "#,
        )
        .bind(encoded)
        .bind(id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("no_such_questionnaire".to_string()));
        }

        Ok(())
    }
}

// Internal row types for sqlx

#[derive(sqlx::FromRow)]
struct UserRow {
    open_id: String,
    name: String,
    student_num: String,
    credit: i64,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            open_id: row.open_id,
            name: row.name,
            student_number: row.student_num,
            credit: row.credit,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DelegationRow {
    id: String,
    publisher: String,
    name: String,
    description: String,
    reward: i64,
    start_time: i64,
    deadline: i64,
    delegation_type: String,
    questionnaire_id: Option<String>,
    max_number: i64,
    current_number: i64,
    state: i64,
}

impl DelegationRow {
    fn into_delegation(self, receivers: Vec<String>) -> Result<Delegation> {
        Ok(Delegation {
            id: self.id,
            publisher: self.publisher,
            receivers,
            name: self.name,
            description: self.description,
            reward: self.reward,
            start_time: self.start_time,
            deadline: self.deadline,
            delegation_type: self.delegation_type,
            questionnaire_id: self.questionnaire_id,
            max_number: self.max_number,
            current_number: self.current_number,
            state: DelegationState::from_code(self.state).map_err(AppError::Internal)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PreviewRow {
    id: String,
    name: String,
    description: String,
    reward: i64,
    deadline: i64,
}

impl From<PreviewRow> for DelegationPreview {
    fn from(row: PreviewRow) -> Self {
        DelegationPreview {
            id: row.id,
            name: row.name,
            description: row.description,
            reward: row.reward,
            deadline: row.deadline,
        }
    }
}

#[derive(sqlx::FromRow)]
struct QuestionnaireRow {
    id: String,
    title: String,
    questions: String,
}

impl TryFrom<QuestionnaireRow> for Questionnaire {
    type Error = AppError;

    fn try_from(row: QuestionnaireRow) -> Result<Self> {
        let questions: Vec<Question> = serde_json::from_str(&row.questions)
            .map_err(|e| AppError::Internal(format!("Invalid questions payload: {}", e)))?;
        Ok(Questionnaire {
            id: row.id,
            title: row.title,
            questions,
        })
    }
}
