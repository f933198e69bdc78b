use diesel::{table, allow_tables_to_appear_in_same_query};

table! {
    notification_records (id) {
        id -> BigInt,
        request_id -> Text,
        request_fingerprint -> Text,
        normalized_phone -> Text,
        recipient_name -> Nullable<Text>,
        event_type -> Text,
        subject_id -> Text,
        rendered_message -> Text,
        status -> Text,
        attempt_count -> Integer,
        last_error -> Nullable<Text>,
        provider_message_id -> Nullable<Text>,
        gateway_response_raw -> Nullable<Text>,
        cancel_requested -> Bool,
        created_at -> Timestamptz,
        last_attempt_at -> Nullable<Timestamptz>,
        next_attempt_at -> Nullable<Timestamptz>,
        updated_at -> Timestamptz,
    }
}

table! {
    notification_templates (id) {
        id -> BigInt,
        event_type -> Text,
        language -> Text,
        body -> Text,
        priority -> Integer,
        active -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    notification_contacts (id) {
        id -> BigInt,
        subject_id -> Text,
        phone_raw -> Text,
        contact_name -> Nullable<Text>,
        contact_type -> Text,
        active -> Bool,
        receive_notifications -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

allow_tables_to_appear_in_same_query!(
    notification_records,
    notification_templates,
    notification_contacts,
);
