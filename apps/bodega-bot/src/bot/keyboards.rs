use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use crate::services::allocator_service::ACCEPTED_QUANTITIES;

pub fn profiles_keyboard(profiles: &[(i64, String)]) -> InlineKeyboardMarkup {
    let rows: Vec<Vec<InlineKeyboardButton>> = profiles
        .iter()
        .map(|(id, name)| {
            vec![InlineKeyboardButton::callback(name.clone(), format!("profile:{}", id))]
        })
        .collect();
    InlineKeyboardMarkup::new(rows)
}

pub fn quantity_keyboard(profile_id: i64) -> InlineKeyboardMarkup {
    let rows: Vec<Vec<InlineKeyboardButton>> = ACCEPTED_QUANTITIES
        .iter()
        .map(|qty| {
            vec![InlineKeyboardButton::callback(
                qty.to_string(),
                format!("qty:{}:{}", profile_id, qty),
            )]
        })
        .collect();
    InlineKeyboardMarkup::new(rows)
}
