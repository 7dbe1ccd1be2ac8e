diesel::table! {
    payments (id) {
        id -> Uuid,
        order_id -> Uuid,
        user_id -> Uuid,
        amount -> Numeric,
        currency -> Varchar,
        status -> Varchar,
        payment_method_id -> Nullable<Varchar>,
        checkout_session_id -> Nullable<Varchar>,
        checkout_url -> Nullable<Text>,
        gateway_intent_id -> Nullable<Varchar>,
        gateway_charge_id -> Nullable<Varchar>,
        failure_code -> Nullable<Varchar>,
        failure_reason -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
