use std::collections::HashMap;

use chrono::Utc;
use diesel::prelude::*;
use diesel::SqliteConnection;
use serde::Deserialize;
use tracing::info;

use crate::error::Error;
use crate::model::{
    Division, Field, Game, GameView, NewScore, Player, Pool, Round, Score, ScoreUpdate, Team,
};
use crate::schema::{divisions, fields, games, players, pools, rounds, scores, teams};

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ScheduleFilter {
    pub division_id: Option<i32>,
    pub round_id: Option<i32>,
    pub field_id: Option<i32>,
    pub team_id: Option<i32>,
}

pub fn list_divisions(conn: &mut SqliteConnection) -> Result<Vec<Division>, Error> {
    Ok(divisions::table
        .order(divisions::name)
        .select(Division::as_select())
        .load(conn)?)
}

pub fn list_pools(
    conn: &mut SqliteConnection,
    division_id: Option<i32>,
) -> Result<Vec<Pool>, Error> {
    let mut query = pools::table.select(Pool::as_select()).into_boxed();
    if let Some(division_id) = division_id {
        query = query.filter(pools::division_id.eq(division_id));
    }
    Ok(query.order((pools::division_id, pools::name)).load(conn)?)
}

pub fn list_rounds(conn: &mut SqliteConnection) -> Result<Vec<Round>, Error> {
    Ok(rounds::table
        .order(rounds::starts_at)
        .select(Round::as_select())
        .load(conn)?)
}

pub fn list_fields(conn: &mut SqliteConnection) -> Result<Vec<Field>, Error> {
    Ok(fields::table
        .order(fields::name)
        .select(Field::as_select())
        .load(conn)?)
}

pub fn get_field(conn: &mut SqliteConnection, field_id: i32) -> Result<Field, Error> {
    fields::table
        .filter(fields::id.eq(field_id))
        .select(Field::as_select())
        .first(conn)
        .optional()?
        .ok_or(Error::NotFound)
}

pub fn list_teams(
    conn: &mut SqliteConnection,
    division_id: Option<i32>,
) -> Result<Vec<Team>, Error> {
    let mut query = teams::table.select(Team::as_select()).into_boxed();
    if let Some(division_id) = division_id {
        query = query.filter(teams::division_id.eq(division_id));
    }
    Ok(query.order(teams::name).load(conn)?)
}

/// A team and its players, by jersey number (unnumbered players last, by name).
pub fn get_roster(conn: &mut SqliteConnection, team_id: i32) -> Result<(Team, Vec<Player>), Error> {
    let team: Team = teams::table
        .filter(teams::id.eq(team_id))
        .select(Team::as_select())
        .first(conn)
        .optional()?
        .ok_or(Error::NotFound)?;

    let mut roster: Vec<Player> = players::table
        .filter(players::team_id.eq(team_id))
        .select(Player::as_select())
        .load(conn)?;
    roster.sort_by(|a, b| {
        let key = |p: &Player| (p.jersey_number.is_none(), p.jersey_number);
        key(a).cmp(&key(b)).then_with(|| a.name.cmp(&b.name))
    });

    Ok((team, roster))
}

/// Attaches team names, field names and scores to a list of games.
fn game_views(conn: &mut SqliteConnection, games: Vec<Game>) -> Result<Vec<GameView>, Error> {
    if games.is_empty() {
        return Ok(Vec::new());
    }

    let game_ids: Vec<i32> = games.iter().map(|g| g.id).collect();
    let team_ids: Vec<i32> = games
        .iter()
        .flat_map(|g| [g.team1_id, g.team2_id])
        .collect();
    let field_ids: Vec<i32> = games.iter().map(|g| g.field_id).collect();

    let team_names: HashMap<i32, String> = teams::table
        .filter(teams::id.eq_any(team_ids))
        .select((teams::id, teams::name))
        .load::<(i32, String)>(conn)?
        .into_iter()
        .collect();
    let field_names: HashMap<i32, String> = fields::table
        .filter(fields::id.eq_any(field_ids))
        .select((fields::id, fields::name))
        .load::<(i32, String)>(conn)?
        .into_iter()
        .collect();
    let mut game_scores: HashMap<i32, Score> = scores::table
        .filter(scores::game_id.eq_any(game_ids))
        .select(Score::as_select())
        .load(conn)?
        .into_iter()
        .map(|s| (s.game_id, s))
        .collect();

    let name_of = |names: &HashMap<i32, String>, id: i32| -> Result<String, Error> {
        names
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Corrupt(format!("dangling reference {id}")))
    };

    games
        .into_iter()
        .map(|game| {
            Ok(GameView {
                team1_name: name_of(&team_names, game.team1_id)?,
                team2_name: name_of(&team_names, game.team2_id)?,
                field_name: name_of(&field_names, game.field_id)?,
                score: game_scores.remove(&game.id),
                game,
            })
        })
        .collect()
}

/// Games matching `filter`, by start time then field.
pub fn list_schedule(
    conn: &mut SqliteConnection,
    filter: &ScheduleFilter,
) -> Result<Vec<GameView>, Error> {
    let mut query = games::table.select(Game::as_select()).into_boxed();
    if let Some(division_id) = filter.division_id {
        query = query.filter(games::division_id.eq(division_id));
    }
    if let Some(round_id) = filter.round_id {
        query = query.filter(games::round_id.eq(round_id));
    }
    if let Some(field_id) = filter.field_id {
        query = query.filter(games::field_id.eq(field_id));
    }
    if let Some(team_id) = filter.team_id {
        query = query.filter(games::team1_id.eq(team_id).or(games::team2_id.eq(team_id)));
    }

    let games = query
        .order((games::starts_at, games::field_id, games::id))
        .load(conn)?;
    game_views(conn, games)
}

pub fn get_game(conn: &mut SqliteConnection, game_id: i32) -> Result<GameView, Error> {
    let game: Game = games::table
        .filter(games::id.eq(game_id))
        .select(Game::as_select())
        .first(conn)
        .optional()?
        .ok_or(Error::NotFound)?;
    game_views(conn, vec![game])?
        .pop()
        .ok_or(Error::NotFound)
}

/// Inserts or updates the score for a game.
///
/// A final score is locked: changing it requires `reopen`, and even then the new values are
/// validated like any other entry.
pub fn upsert_score(
    conn: &mut SqliteConnection,
    game_id: i32,
    update: &ScoreUpdate,
) -> Result<Score, Error> {
    if update.team1_score < 0 || update.team2_score < 0 {
        return Err(Error::Validation("scores cannot be negative".to_string()));
    }

    conn.transaction(|conn| {
        let game_exists: i64 = games::table
            .filter(games::id.eq(game_id))
            .count()
            .get_result(conn)?;
        if game_exists == 0 {
            return Err(Error::NotFound);
        }

        let existing: Option<Score> = scores::table
            .filter(scores::game_id.eq(game_id))
            .select(Score::as_select())
            .first(conn)
            .optional()?;

        let now = Utc::now().naive_utc();
        let score = match existing {
            Some(current) if current.is_finished && !update.reopen => {
                return Err(Error::ScoreLocked);
            }
            Some(current) => diesel::update(scores::table.filter(scores::id.eq(current.id)))
                .set((
                    scores::team1_score.eq(update.team1_score),
                    scores::team2_score.eq(update.team2_score),
                    scores::is_finished.eq(update.is_finished),
                    scores::updated_at.eq(now),
                ))
                .returning(Score::as_returning())
                .get_result(conn)?,
            None => diesel::insert_into(scores::table)
                .values(&NewScore {
                    game_id,
                    team1_score: update.team1_score,
                    team2_score: update.team2_score,
                    is_finished: update.is_finished,
                    updated_at: now,
                })
                .returning(Score::as_returning())
                .get_result(conn)?,
        };

        info!(
            game_id,
            team1 = score.team1_score,
            team2 = score.team2_score,
            finished = score.is_finished,
            "score updated"
        );
        Ok(score)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use chrono::Duration;

    fn update(team1_score: i32, team2_score: i32, is_finished: bool, reopen: bool) -> ScoreUpdate {
        ScoreUpdate {
            team1_score,
            team2_score,
            is_finished,
            reopen,
        }
    }

    #[test]
    fn test_schedule_views_and_filters() {
        run_test_in_transaction(|conn| {
            let open = insert_division(conn, "Open");
            let women = insert_division(conn, "Women");
            let f1 = insert_field(conn, "Field 1");
            let f2 = insert_field(conn, "Field 2");
            let a = insert_team(conn, "Aardvarks", open);
            let b = insert_team(conn, "Badgers", open);
            let c = insert_team(conn, "Cougars", women);
            let d = insert_team(conn, "Dingos", women);

            let t0 = now();
            let late = insert_game(conn, open, f1, a, b, t0 + Duration::hours(2));
            let early = insert_game(conn, women, f2, c, d, t0);
            let early_f1 = insert_game(conn, open, f1, b, a, t0);

            let all = list_schedule(conn, &ScheduleFilter::default())?;
            assert_eq!(
                all.iter().map(|g| g.game.id).collect::<Vec<_>>(),
                vec![early_f1, early, late]
            );
            assert_eq!(all[1].team1_name, "Cougars");
            assert_eq!(all[1].field_name, "Field 2");
            assert!(all[1].score.is_none());

            let women_games = list_schedule(
                conn,
                &ScheduleFilter {
                    division_id: Some(women),
                    ..Default::default()
                },
            )?;
            assert_eq!(women_games.len(), 1);

            let aardvark_games = list_schedule(
                conn,
                &ScheduleFilter {
                    team_id: Some(a),
                    ..Default::default()
                },
            )?;
            assert_eq!(aardvark_games.len(), 2);

            upsert_score(conn, late, &update(7, 5, false, false))?;
            let view = get_game(conn, late)?;
            assert_eq!(view.score.map(|s| (s.team1_score, s.team2_score)), Some((7, 5)));
            assert!(matches!(get_game(conn, 999), Err(Error::NotFound)));

            let teams = list_teams(conn, Some(open))?;
            assert_eq!(teams.len(), 2);
            assert_eq!(list_divisions(conn)?.len(), 2);
            assert_eq!(list_fields(conn)?[0].name, "Field 1");
            Ok(())
        });
    }

    #[test]
    fn test_finished_score_is_locked_until_reopened() {
        run_test_in_transaction(|conn| {
            let division = insert_division(conn, "Mixed");
            let field = insert_field(conn, "Field 9");
            let a = insert_team(conn, "Hammers", division);
            let b = insert_team(conn, "Hucks", division);
            let game = insert_game(conn, division, field, a, b, now());

            let first = upsert_score(conn, game, &update(3, 2, false, false))?;
            let second = upsert_score(conn, game, &update(8, 6, true, false))?;
            assert_eq!(first.id, second.id);
            assert!(second.is_finished);

            let err = upsert_score(conn, game, &update(9, 6, true, false)).expect_err("locked");
            assert!(matches!(err, Error::ScoreLocked));

            let reopened = upsert_score(conn, game, &update(8, 7, false, true))?;
            assert!(!reopened.is_finished);
            assert_eq!(reopened.team2_score, 7);

            assert!(matches!(
                upsert_score(conn, game, &update(-1, 0, false, false)),
                Err(Error::Validation(_))
            ));
            assert!(matches!(
                upsert_score(conn, 12345, &update(1, 0, false, false)),
                Err(Error::NotFound)
            ));
            Ok(())
        });
    }

    #[test]
    fn test_roster_order() {
        run_test_in_transaction(|conn| {
            let division = insert_division(conn, "Open");
            let team = insert_team(conn, "Flyers", division);
            for (name, number) in [("Zed", Some(1)), ("Amy", None), ("Bo", Some(0)), ("Al", None)] {
                diesel::insert_into(players::table)
                    .values((
                        players::team_id.eq(team),
                        players::name.eq(name),
                        players::jersey_number.eq(number),
                    ))
                    .execute(conn)?;
            }

            let (loaded, roster) = get_roster(conn, team)?;
            assert_eq!(loaded.name, "Flyers");
            assert_eq!(
                roster.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
                vec!["Bo", "Zed", "Al", "Amy"]
            );
            assert!(matches!(get_roster(conn, 404), Err(Error::NotFound)));
            Ok(())
        });
    }
}
