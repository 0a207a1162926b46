diesel::table! {
    publishers (id) {
        id -> Int8,
        publisher_type -> Int2,
        name -> Varchar,
        nick -> Varchar,
        description -> Text,
        realm_id -> Nullable<Int8>,
        account_id -> Nullable<Int8>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    categories (id) {
        id -> Int8,
        alias -> Varchar,
        name -> Varchar,
        description -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    tags (id) {
        id -> Int8,
        alias -> Varchar,
        name -> Varchar,
        description -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    posts (id) {
        id -> Int8,
        post_type -> Varchar,
        body -> Jsonb,
        language -> Varchar,
        alias -> Nullable<Varchar>,
        alias_prefix -> Nullable<Varchar>,
        visibility -> Int2,
        visible_users -> Array<Int8>,
        invisible_users -> Array<Int8>,
        realm_id -> Nullable<Int8>,
        is_draft -> Bool,
        published_at -> Nullable<Timestamptz>,
        published_until -> Nullable<Timestamptz>,
        reply_id -> Nullable<Int8>,
        repost_id -> Nullable<Int8>,
        total_upvote -> Int4,
        total_downvote -> Int4,
        total_views -> Int8,
        total_aggressive_views -> Int8,
        is_collapsed -> Bool,
        locked_at -> Nullable<Timestamptz>,
        pinned_at -> Nullable<Timestamptz>,
        edited_at -> Nullable<Timestamptz>,
        publisher_id -> Int8,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    post_categories (post_id, category_id) {
        post_id -> Int8,
        category_id -> Int8,
    }
}

diesel::table! {
    post_tags (post_id, tag_id) {
        post_id -> Int8,
        tag_id -> Int8,
    }
}

diesel::table! {
    reactions (id) {
        id -> Int8,
        symbol -> Varchar,
        attitude -> Int2,
        post_id -> Int8,
        account_id -> Int8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    post_flags (id) {
        id -> Int8,
        post_id -> Int8,
        account_id -> Int8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    post_views (post_id, account_id) {
        post_id -> Int8,
        account_id -> Int8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    subscriptions (id) {
        id -> Int8,
        follower_id -> Int8,
        publisher_id -> Nullable<Int8>,
        tag_id -> Nullable<Int8>,
        category_id -> Nullable<Int8>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    fediverse_users (id) {
        id -> Int8,
        identifier -> Varchar,
        origin -> Varchar,
        name -> Varchar,
        nick -> Varchar,
        avatar -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    fediverse_posts (id) {
        id -> Int8,
        identifier -> Varchar,
        origin -> Varchar,
        content -> Text,
        language -> Varchar,
        images -> Array<Text>,
        user_id -> Int8,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(posts -> publishers (publisher_id));
diesel::joinable!(post_categories -> posts (post_id));
diesel::joinable!(post_categories -> categories (category_id));
diesel::joinable!(post_tags -> posts (post_id));
diesel::joinable!(post_tags -> tags (tag_id));
diesel::joinable!(reactions -> posts (post_id));
diesel::joinable!(post_flags -> posts (post_id));
diesel::joinable!(post_views -> posts (post_id));
diesel::joinable!(fediverse_posts -> fediverse_users (user_id));

diesel::allow_tables_to_appear_in_same_query!(
    publishers,
    categories,
    tags,
    posts,
    post_categories,
    post_tags,
    reactions,
    post_flags,
    post_views,
    subscriptions,
    fediverse_users,
    fediverse_posts,
);
