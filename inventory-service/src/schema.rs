diesel::table! {
    products (id) {
        id -> Uuid,
        sku -> Varchar,
        name -> Varchar,
        stock -> Int4,
        price -> Numeric,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        order_id -> Uuid,
        product_id -> Uuid,
        qty -> Int4,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        external_id -> Varchar,
        user_id -> Varchar,
        status -> Varchar,
        total_amount -> Numeric,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(reservations -> products (product_id));

diesel::allow_tables_to_appear_in_same_query!(
    products,
    reservations,
    orders,
);
