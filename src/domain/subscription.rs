use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Unsubscribed,
    Bounced,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "PENDING",
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Unsubscribed => "UNSUBSCRIBED",
            SubscriptionStatus::Bounced => "BOUNCED",
        }
    }
}

impl TryFrom<&str> for SubscriptionStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "ACTIVE" => Ok(Self::Active),
            "UNSUBSCRIBED" => Ok(Self::Unsubscribed),
            "BOUNCED" => Ok(Self::Bounced),
            other => Err(format!("{} is not a subscription status.", other)),
        }
    }
}
