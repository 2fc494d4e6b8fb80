use rust_decimal::Decimal;

use engage_core::config::PricingConfig;
use engage_core::error::{EngageError, Result};
use engage_core::types::{Channel, MessagePayload};

/// GSM 03.38 basic character set.
const GSM7_BASIC: &str = "@£$¥èéùìòÇ\nØø\rÅåΔ_ΦΓΛΩΠΨΣΘΞÆæßÉ !\"#¤%&'()*+,-./0123456789:;<=>?\
¡ABCDEFGHIJKLMNOPQRSTUVWXYZÄÖÑÜ§¿abcdefghijklmnopqrstuvwxyzäöñüà";

/// Characters reachable through the GSM escape; each costs two septets.
const GSM7_EXTENDED: &str = "^{}\\[~]|€\u{000C}";

const GSM7_SINGLE: usize = 160;
const GSM7_CONCAT: usize = 153;
const UCS2_SINGLE: usize = 70;
const UCS2_CONCAT: usize = 67;

/// SMS body encoding, decided by the characters present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsEncoding {
    Gsm7,
    Ucs2,
}

/// Encoding and segment count for an SMS body.
pub fn sms_segments(body: &str) -> (SmsEncoding, u32) {
    let mut septets = 0usize;
    let mut gsm7 = true;
    for c in body.chars() {
        if GSM7_BASIC.contains(c) {
            septets += 1;
        } else if GSM7_EXTENDED.contains(c) {
            septets += 2;
        } else {
            gsm7 = false;
            break;
        }
    }

    if gsm7 {
        (SmsEncoding::Gsm7, segments_for(septets, GSM7_SINGLE, GSM7_CONCAT))
    } else {
        let units = body.encode_utf16().count();
        (SmsEncoding::Ucs2, segments_for(units, UCS2_SINGLE, UCS2_CONCAT))
    }
}

fn segments_for(len: usize, single: usize, concat: usize) -> u32 {
    if len <= single {
        1
    } else {
        len.div_ceil(concat) as u32
    }
}

/// Cost estimator over the configured price table.
#[derive(Debug, Clone, Default)]
pub struct Pricing {
    config: PricingConfig,
}

impl Pricing {
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    /// Unit price for a channel, honoring a cost-class override.
    pub fn unit_price(&self, channel: Channel, cost_class: Option<&str>) -> Decimal {
        cost_class
            .and_then(|class| {
                self.config
                    .classes
                    .get(channel.code())
                    .and_then(|classes| classes.get(class))
            })
            .copied()
            .unwrap_or_else(|| self.config.unit_price(channel))
    }

    /// Estimated cost of one send. SMS is charged per segment; every other
    /// channel is flat per message or call.
    pub fn estimate(&self, channel: Channel, payload: &MessagePayload) -> Result<Decimal> {
        let unit = self.unit_price(channel, payload.cost_class.as_deref());
        match channel {
            Channel::Sms => {
                let (_, segments) = sms_segments(&payload.body);
                unit.checked_mul(Decimal::from(segments)).ok_or_else(|| {
                    EngageError::InvalidAmount(format!(
                        "{} segments at {} overflows the price range",
                        segments, unit
                    ))
                })
            }
            Channel::WhatsApp | Channel::Voip | Channel::Rcs => Ok(unit),
        }
    }
}
