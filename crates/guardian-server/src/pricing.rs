//! Cost pricing for billable upstream services.
//!
//! Every price is a pure function of usage units and the configured
//! [`PricingConfig`]; nothing here is hardcoded beyond the config defaults.

use guardian_core::PricingConfig;
use serde::{Deserialize, Serialize};

/// Upstream service categories the Guardian knows how to price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillableService {
    /// Text generation, priced per 1k input and output tokens.
    TextGeneration,
    /// Speech synthesis, priced per character.
    SpeechSynthesis,
    SmsOutbound,
    SmsInbound,
    /// Voice calls, priced per minute.
    Voice,
    /// Card processing fee on a charged amount.
    CardFee,
    /// Mapping lookups, priced per request.
    Maps,
}

impl BillableService {
    pub fn as_str(self) -> &'static str {
        match self {
            BillableService::TextGeneration => "text_generation",
            BillableService::SpeechSynthesis => "speech_synthesis",
            BillableService::SmsOutbound => "sms_outbound",
            BillableService::SmsInbound => "sms_inbound",
            BillableService::Voice => "voice",
            BillableService::CardFee => "card_fee",
            BillableService::Maps => "maps",
        }
    }

    /// Parse a service key, accepting a few upstream vendor aliases.
    pub fn parse(name: &str) -> Option<Self> {
        let service = match name.to_ascii_lowercase().as_str() {
            "text_generation" | "llm" | "claude" => BillableService::TextGeneration,
            "speech_synthesis" | "tts" | "elevenlabs" => BillableService::SpeechSynthesis,
            "sms_outbound" | "sms" | "twilio_sms" => BillableService::SmsOutbound,
            "sms_inbound" => BillableService::SmsInbound,
            "voice" | "twilio_voice" => BillableService::Voice,
            "card_fee" | "stripe" => BillableService::CardFee,
            "maps" | "google_maps" => BillableService::Maps,
            _ => return None,
        };
        Some(service)
    }
}

/// Prices usage units with the configured unit costs.
#[derive(Debug, Clone)]
pub struct Pricing {
    config: PricingConfig,
}

impl Pricing {
    pub fn new(config: &PricingConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn text_generation(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        (tokens_in as f64 / 1000.0) * self.config.text_input_per_1k_tokens
            + (tokens_out as f64 / 1000.0) * self.config.text_output_per_1k_tokens
    }

    pub fn speech_synthesis(&self, characters: u64) -> f64 {
        characters as f64 * self.config.speech_per_character
    }

    pub fn sms(&self, outbound: bool) -> f64 {
        if outbound {
            self.config.sms_outbound
        } else {
            self.config.sms_inbound
        }
    }

    pub fn voice(&self, minutes: f64) -> f64 {
        minutes.max(0.0) * self.config.voice_per_minute
    }

    /// Processing fee on a charged amount.
    pub fn card_fee(&self, amount: f64) -> f64 {
        amount.max(0.0) * self.config.card_fee_rate + self.config.card_fee_fixed
    }

    pub fn maps(&self, requests: u64) -> f64 {
        requests as f64 * self.config.maps_per_request
    }

    /// Price one usage event.
    ///
    /// `units` means characters, minutes, amount charged or requests
    /// depending on the service; it defaults to one unit. Text generation is
    /// priced from the token counts.
    pub fn price(
        &self,
        service: BillableService,
        units: Option<f64>,
        tokens_in: u64,
        tokens_out: u64,
    ) -> f64 {
        let units = units.filter(|u| u.is_finite() && *u >= 0.0).unwrap_or(1.0);
        match service {
            BillableService::TextGeneration => self.text_generation(tokens_in, tokens_out),
            BillableService::SpeechSynthesis => self.speech_synthesis(units.round() as u64),
            BillableService::SmsOutbound => self.sms(true) * units,
            BillableService::SmsInbound => self.sms(false) * units,
            BillableService::Voice => self.voice(units),
            BillableService::CardFee => self.card_fee(units),
            BillableService::Maps => self.maps(units.round() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing() -> Pricing {
        Pricing::new(&PricingConfig::default())
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_text_generation_per_1k_tokens() {
        // 2k in at 0.003 + 1k out at 0.015
        assert!(approx(pricing().text_generation(2000, 1000), 0.021));
        assert!(approx(pricing().text_generation(0, 0), 0.0));
    }

    #[test]
    fn test_unit_priced_services() {
        let p = pricing();
        assert!(approx(p.speech_synthesis(1000), 0.03));
        assert!(approx(p.sms(true), 0.05));
        assert!(approx(p.sms(false), 0.01));
        assert!(approx(p.voice(3.0), 0.06));
        assert!(approx(p.card_fee(100.0), 3.2));
        assert!(approx(p.maps(10), 0.05));
    }

    #[test]
    fn test_price_dispatch_and_default_units() {
        let p = pricing();
        assert!(approx(p.price(BillableService::SmsOutbound, None, 0, 0), 0.05));
        assert!(approx(p.price(BillableService::SmsOutbound, Some(3.0), 0, 0), 0.15));
        assert!(approx(p.price(BillableService::Maps, Some(-4.0), 0, 0), 0.005));
        assert!(approx(
            p.price(BillableService::TextGeneration, Some(99.0), 1000, 0),
            0.003
        ));
    }

    #[test]
    fn test_custom_prices_are_honoured() {
        let p = Pricing::new(&PricingConfig {
            sms_outbound: 0.08,
            ..PricingConfig::default()
        });
        assert!(approx(p.sms(true), 0.08));
    }

    #[test]
    fn test_service_aliases() {
        assert_eq!(
            BillableService::parse("claude"),
            Some(BillableService::TextGeneration)
        );
        assert_eq!(BillableService::parse("STRIPE"), Some(BillableService::CardFee));
        assert_eq!(BillableService::parse("carrier_pigeon"), None);
        assert_eq!(BillableService::Voice.as_str(), "voice");
    }
}
