//! Data models for users, delegations and questionnaires

use serde::{Deserialize, Serialize};

/// A registered user and their credit balance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub open_id: String,
    pub name: String,
    pub student_number: String,
    pub credit: i64,
}

/// Lifecycle state of a delegation, persisted as its integer code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationState {
    /// Open, accepting receivers
    Published,
    /// Capacity full, awaiting work
    Accepted,
    /// Terminal, cancelled by publisher or last receiver
    Canceled,
    /// Sole receiver reported completion, awaiting publisher confirmation
    Pending,
    /// Terminal, payout settled
    Finished,
}

impl DelegationState {
    pub fn code(&self) -> i64 {
        match self {
            DelegationState::Published => 0,
            DelegationState::Accepted => 1,
            DelegationState::Canceled => 2,
            DelegationState::Pending => 3,
            DelegationState::Finished => 4,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, String> {
        match code {
            0 => Ok(DelegationState::Published),
            1 => Ok(DelegationState::Accepted),
            2 => Ok(DelegationState::Canceled),
            3 => Ok(DelegationState::Pending),
            4 => Ok(DelegationState::Finished),
            _ => Err(format!("Invalid delegation state code: {}", code)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DelegationState::Published => "published",
            DelegationState::Accepted => "accepted",
            DelegationState::Canceled => "canceled",
            DelegationState::Pending => "pending",
            DelegationState::Finished => "finished",
        }
    }

    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, DelegationState::Canceled | DelegationState::Finished)
    }

    /// States from which a cancel is allowed
    pub fn is_cancelable(&self) -> bool {
        matches!(self, DelegationState::Published | DelegationState::Accepted)
    }
}

/// A unit of work offered for credits
///
/// `reward * max_number` credits are escrowed from the publisher at creation;
/// each receiver additionally escrows `reward` of their own when accepting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    pub id: String,
    pub publisher: String,
    pub receivers: Vec<String>,
    pub name: String,
    pub description: String,
    /// Integer credits per receiver slot
    pub reward: i64,
    /// Epoch seconds
    pub start_time: i64,
    /// Epoch seconds
    pub deadline: i64,
    pub delegation_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub questionnaire_id: Option<String>,
    /// Receiver capacity, >= 1 at creation
    pub max_number: i64,
    /// Count of active receivers, always equals `receivers.len()`
    pub current_number: i64,
    pub state: DelegationState,
}

impl Delegation {
    pub fn is_receiver(&self, user_id: &str) -> bool {
        self.receivers.iter().any(|r| r == user_id)
    }

    pub fn is_publisher(&self, user_id: &str) -> bool {
        self.publisher == user_id
    }

    /// Total credits escrowed from the publisher at creation
    pub fn publisher_escrow(&self) -> i64 {
        self.reward * self.max_number
    }
}

/// Listing entry, the subset of fields shown in paginated previews
#[derive(Debug, Clone, Serialize)]
pub struct DelegationPreview {
    pub id: String,
    pub name: String,
    pub description: String,
    pub reward: i64,
    pub deadline: i64,
}

/// One selectable option of a questionnaire question, with its fill count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerOption {
    pub option: String,
    #[serde(default)]
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub topic: String,
    pub answers: Vec<AnswerOption>,
}

/// Structured survey attached to a questionnaire-type delegation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Questionnaire {
    pub id: String,
    pub title: String,
    pub questions: Vec<Question>,
}

impl Questionnaire {
    /// Questions stripped of counts, the shape handed out for filling
    pub fn preview(&self) -> QuestionnairePreview {
        QuestionnairePreview {
            title: self.title.clone(),
            questions: self
                .questions
                .iter()
                .map(|q| QuestionPreview {
                    topic: q.topic.clone(),
                    options: q.answers.iter().map(|a| a.option.clone()).collect(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionnairePreview {
    pub title: String,
    pub questions: Vec<QuestionPreview>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionPreview {
    pub topic: String,
    pub options: Vec<String>,
}

// Request bodies

/// Request to register a user
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub code: String,
    pub name: String,
    pub student_number: String,
}

/// Request to open a session
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub code: String,
}

/// Questionnaire definition supplied at delegation creation
#[derive(Debug, Clone, Deserialize)]
pub struct QuestionnaireDefinition {
    pub title: String,
    pub questions: Vec<Question>,
}

/// Request to create a delegation
#[derive(Debug, Deserialize)]
pub struct CreateDelegationRequest {
    pub name: String,
    pub description: String,
    pub reward: i64,
    pub deadline: i64,
    #[serde(rename = "type")]
    pub delegation_type: String,
    pub max_number: i64,
    pub questionnaire: Option<QuestionnaireDefinition>,
}

/// One filled questionnaire response: per-option counts to merge in
#[derive(Debug, Deserialize)]
pub struct QuestionnaireRecord {
    pub questions: Vec<Question>,
}
