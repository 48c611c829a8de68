// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Built-in receipt templates.

use chrono::Local;

use receiptlink_bridge::ContentSource;
use receiptlink_core::{Order, PrinterConfig, Result};

/// Template used when the caller names none.
pub const DEFAULT_TEMPLATE: &str = "counter";

/// Renders orders with the built-in templates.
///
/// `counter` is the customer copy; `kitchen` is a ticket with the order number
/// as large as the printer allows.
pub struct OrderReceipt {
    shop_name: String,
}

impl OrderReceipt {
    pub fn new(shop_name: impl Into<String>) -> Self {
        Self {
            shop_name: shop_name.into(),
        }
    }
}

impl ContentSource for OrderReceipt {
    fn order_receipt(
        &self,
        order: &Order,
        config: &PrinterConfig,
        template_id: Option<&str>,
    ) -> Result<String> {
        let placed = order.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M");
        let rule = "-".repeat(config.paper_width.chars_per_line());
        let lines = match template_id.unwrap_or(DEFAULT_TEMPLATE) {
            "kitchen" => vec![
                "[C]<b>KITCHEN</b>".to_string(),
                format!("[C]<dw><dh>{}</dh></dw>", order.number),
                format!("[C]{placed}"),
            ],
            _ => vec![
                format!("[C]<b><dw>{}</dw></b>", self.shop_name),
                format!("[C]{rule}"),
                format!("[L]Order:[R]<b>{}</b>", order.number),
                format!("[L]Placed:[R]{placed}"),
                format!("[C]{rule}"),
                "[C]<u>Thank you!</u>".to_string(),
            ],
        };
        Ok(lines.join("\n"))
    }
}
