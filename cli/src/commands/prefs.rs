use anyhow::Result;

use tally_core::service::TrackerService;

use super::helpers::parse_week_start;

pub(crate) fn cmd_prefs_show(svc: &TrackerService, json: bool) -> Result<()> {
    let prefs = svc.get_preferences()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&prefs)?);
    } else {
        println!("Streak threshold: {}%", prefs.streak_threshold);
        println!("Week starts on:   day {} (0 = Monday)", prefs.week_start);
        match &prefs.timezone {
            Some(tz) => println!("Timezone:         {tz}"),
            None => println!("Timezone:         system default"),
        }
    }
    Ok(())
}

pub(crate) fn cmd_prefs_set(
    svc: &TrackerService,
    threshold: Option<i64>,
    week_start: Option<String>,
    timezone: Option<String>,
    json: bool,
) -> Result<()> {
    if threshold.is_none() && week_start.is_none() && timezone.is_none() {
        anyhow::bail!("Nothing to set. Use --threshold, --week-start, or --timezone");
    }
    if let Some(t) = threshold {
        svc.set_streak_threshold(t)?;
    }
    if let Some(ws) = week_start {
        svc.set_week_start(parse_week_start(&ws)?)?;
    }
    if let Some(tz) = timezone {
        svc.set_timezone(&tz)?;
    }
    cmd_prefs_show(svc, json)
}
