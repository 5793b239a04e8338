diesel::table! {
    subscriptions (id) {
        id -> Uuid,
        email -> Text,
        name -> Text,
        subscribed_at -> Timestamptz,
        status -> Text,
        unsubscribed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    users (user_id) {
        user_id -> Uuid,
        username -> Text,
        password_hash -> Text,
    }
}

diesel::table! {
    campaigns (id) {
        id -> Uuid,
        title -> Text,
        subject -> Text,
        template_id -> Text,
        recipient_filter -> Jsonb,
        scheduled_at -> Nullable<Timestamptz>,
        status -> Text,
        recipient_count -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        sent_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    campaign_deliveries (id) {
        id -> Uuid,
        campaign_id -> Uuid,
        email -> Text,
        status -> Text,
        attempts -> Int4,
        max_attempts -> Int4,
        provider_message_id -> Nullable<Text>,
        last_error -> Nullable<Text>,
        queued_at -> Timestamptz,
        next_attempt_at -> Timestamptz,
        claimed_at -> Nullable<Timestamptz>,
        last_attempt_at -> Nullable<Timestamptz>,
        sent_at -> Nullable<Timestamptz>,
        delivered_at -> Nullable<Timestamptz>,
        opened_at -> Nullable<Timestamptz>,
        clicked_at -> Nullable<Timestamptz>,
        bounced_at -> Nullable<Timestamptz>,
        complained_at -> Nullable<Timestamptz>,
        failed_at -> Nullable<Timestamptz>,
        dead_lettered_at -> Nullable<Timestamptz>,
        dead_lettered_by -> Nullable<Text>,
        redriven_at -> Nullable<Timestamptz>,
        redriven_by -> Nullable<Text>,
        version -> Int4,
    }
}

diesel::table! {
    newsletter_events (id) {
        id -> Uuid,
        provider -> Text,
        provider_event_id -> Text,
        email -> Text,
        campaign_id -> Nullable<Uuid>,
        event_type -> Text,
        occurred_at -> Timestamptz,
        payload -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    suppressions (email) {
        email -> Text,
        reason -> Text,
        source -> Nullable<Text>,
        bounce_type -> Nullable<Text>,
        error_code -> Nullable<Text>,
        error_message -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(campaign_deliveries -> campaigns (campaign_id));

diesel::allow_tables_to_appear_in_same_query!(
    subscriptions,
    users,
    campaigns,
    campaign_deliveries,
    newsletter_events,
    suppressions,
);
