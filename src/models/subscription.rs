use crate::schema::subscriptions;
use chrono::offset::Utc;
use chrono::DateTime;

#[derive(Queryable, Selectable)]
#[diesel(table_name = subscriptions)]
pub struct Subscription {
    pub id: uuid::Uuid,
    pub email: String,
    pub name: String,
    pub subscribed_at: DateTime<Utc>,
    pub status: String,
    pub unsubscribed_at: Option<DateTime<Utc>>,
}

#[derive(Insertable)]
#[diesel(table_name = subscriptions)]
pub struct NewSubscription<'a> {
    pub id: &'a uuid::Uuid,
    pub email: &'a str,
    pub name: &'a str,
    pub subscribed_at: &'a DateTime<Utc>,
    pub status: &'a str,
}
